//! The bytecode interpreter loop (spec.md §5).
//!
//! Grounded on the teacher's `run.rs`/`Runner` for the overall "own a heap,
//! drive a frame stack, surface one terminal result" shape, generalized from
//! Python's generator-based async resumption (dropped — spec.md §5 is
//! explicitly single-threaded and non-suspending) to a plain `loop { match
//! opcode { ... } }` dispatch over `src/bytecode.rs`'s `Opcode`, matching
//! `examples/original_source/src/vm/vm.c`'s own dispatch-loop shape.

mod call;
mod import;
mod iter;
mod ops;

use ahash::{AHashMap, AHashSet};

use crate::{
    bytecode::Opcode,
    error::{Panic, PanicKind, RunResult},
    heap::{Heap, HeapData, HeapId},
    imports::{FsSourceLoader, ImportResolver, SourceLoader},
    objects::{PyroClosure, PyroModule, UpvalueState},
    resource::{NoLimitTracker, ResourceTracker},
    tracer::{NoopTracer, VmTracer},
    value::Value,
};

/// One call frame: the executing closure, an instruction pointer, and the
/// base index into the VM's value stack where this call's locals begin.
/// `with_mark` is how many `with`-guards existed when this frame was
/// entered, so an early `return` can unwind (and `$exit`) any guards opened
/// since, per spec.md §5's `with_stack_count_on_entry`.
pub(crate) struct CallFrame {
    pub closure: HeapId,
    pub ip: usize,
    pub base: usize,
    /// Where `Return` truncates the stack back to before pushing the result:
    /// `base` for a method call (the receiver occupies the callee slot, which
    /// is local slot 0), `base - 1` for a plain call (the callee slot sits
    /// dead one below `base`). Computed once at call time so `Return` never
    /// has to re-derive `is_method` (spec.md §4.2's calling convention).
    pub result_slot: usize,
    pub with_mark: usize,
    /// Set for a class-instantiation call (`ClassName(args)`): `init`'s own
    /// return value is discarded and this value — the freshly allocated
    /// instance — is pushed in its place (spec.md §4.2).
    pub override_return: Option<Value>,
}

/// A `with`-block's saved cleanup obligation: the bound value whose `$exit`
/// method runs when the block ends, including via an early `return`
/// unwinding through it (spec.md §4.2, §5).
struct WithGuard {
    value: Value,
}

pub struct Vm<T: ResourceTracker = NoLimitTracker> {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<HeapId>,
    globals: AHashMap<HeapId, Value>,
    /// Names installed through `define_global` (native builtins at startup,
    /// and anything an embedder adds via `define_superglobal`) — read-only to
    /// user code (spec.md §8, GLOSSARY). Tracked separately from `globals`
    /// itself since both superglobals and ordinary module-level globals share
    /// one lookup table at runtime (spec.md §4's "falling back to the
    /// superglobal table" is a compile-time distinction the single-module
    /// build collapses into one map; `SetGlobal` still has to tell them apart
    /// to reject user assignment to the former).
    superglobals: AHashSet<HeapId>,
    with_guards: Vec<WithGuard>,
    /// Every top-level closure (the compiled script, and anything it
    /// defines) is attributed to this synthetic module so `PyroClosure`
    /// never needs an optional module field (spec.md's module system proper
    /// — named imports with their own member tables — lives in `imports.rs`).
    main_module: HeapId,
    tracker: T,
    tracer: Box<dyn VmTracer>,
    /// Resolves and caches `import`ed modules by dotted path (spec.md §4.7).
    /// Dylib-backed candidates are left to the embedder
    /// (`imports::DylibModuleLoader`'s signature names `embed::Vm` directly),
    /// so `vm/import.rs` panics with `PanicKind::ImportError` on one rather
    /// than loading it itself.
    resolver: ImportResolver,
    source_loader: Box<dyn SourceLoader>,
}

impl Vm<NoLimitTracker> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_tracker(NoLimitTracker)
    }
}

impl Default for Vm<NoLimitTracker> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ResourceTracker> Vm<T> {
    #[must_use]
    pub fn with_tracker(tracker: T) -> Self {
        let mut heap = Heap::new();
        let module_name = heap.intern_str("main");
        let main_module = heap.alloc(HeapData::Module(PyroModule { name: module_name, ..PyroModule::default() }));
        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            globals: AHashMap::new(),
            superglobals: AHashSet::new(),
            with_guards: Vec::new(),
            main_module,
            tracker,
            tracer: Box::new(NoopTracer),
            resolver: ImportResolver::new(),
            source_loader: Box::new(FsSourceLoader),
        };
        crate::native::install(&mut vm);
        vm
    }

    pub fn set_tracer(&mut self, tracer: Box<dyn VmTracer>) {
        self.tracer = tracer;
    }

    /// Adds a filesystem root `import` resolution searches, in add-order
    /// (spec.md §4.7). `embed::Vm::add_import_root` forwards here.
    pub fn add_import_root(&mut self, root: impl Into<std::path::PathBuf>) {
        self.resolver.add_root(root);
    }

    /// Overrides how `import` reads a resolved `.pyro` file's bytes, e.g. to
    /// serve modules from memory in tests. `embed::Vm::set_source_loader`
    /// forwards here.
    pub fn set_source_loader(&mut self, loader: Box<dyn SourceLoader>) {
        self.source_loader = loader;
    }

    /// The synthetic module every top-level script and its `def`/`class`
    /// declarations belong to — the natural target for an embedder's
    /// `define_pub_member`/`define_native_fn` before any `import` has run.
    #[must_use]
    pub fn main_module_id(&self) -> HeapId {
        self.main_module
    }

    /// Installs a superglobal: a native builtin at startup, or anything an
    /// embedder adds via `define_superglobal`. Read-only to user code once
    /// installed — `Opcode::SetGlobal` consults `is_superglobal` and panics
    /// rather than letting a script overwrite it.
    pub fn define_global(&mut self, name: &str, value: Value) {
        let id = self.heap.intern_str(name);
        self.globals.insert(id, value);
        self.superglobals.insert(id);
    }

    pub(crate) fn is_superglobal(&self, name: HeapId) -> bool {
        self.superglobals.contains(&name)
    }

    #[must_use]
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let bytes = name.as_bytes();
        self.globals.iter().find(|(k, _)| self.heap.str_bytes(**k).as_bytes() == bytes).map(|(_, v)| *v)
    }

    /// Runs a top-level script function (arity 0, produced by
    /// `Compiler::compile`) to completion, returning its final `echo`-less
    /// result (always `Value::Null` for a bare script; non-null only when
    /// invoked as a callable value by an embedder).
    pub fn run_script(&mut self, script_fn: HeapId) -> RunResult<Value> {
        let closure_data =
            PyroClosure { function: script_fn, upvalues: Default::default(), module: self.main_module, is_default_value_expr: false };
        let closure = self.heap.alloc(HeapData::Closure(closure_data));
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0)?;
        self.run_until(0)
    }

    /// The dispatch loop, driven until the call stack unwinds back to
    /// `target_depth` frames. `target_depth` is `0` for the top-level script;
    /// a nonzero depth lets native/dunder call sites (`$next`, `init`,
    /// operator overloads, `try EXPR`) synchronously drive one nested call
    /// to completion without re-entering the interpreter recursively in
    /// Rust. A panic always propagates to the caller of `run_until` — only
    /// `Opcode::Try`'s handler (in `call.rs`) catches one, by calling
    /// `run_until` at a deeper target and converting an `Err` result into an
    /// `Error` value, matching `examples/original_source/src/core/exec.c`'s
    /// `PYRO_OPCODE_TRY` handler (a recursive `run()` call whose panic flag
    /// is caught by its immediate caller, not by an unwind-to-guard search).
    pub(crate) fn run_until(&mut self, target_depth: usize) -> RunResult<Value> {
        loop {
            if self.frames.len() <= target_depth {
                return Ok(self.stack.pop().unwrap_or(Value::Null));
            }
            let Some((ip, op)) = self.fetch_opcode() else {
                return Ok(self.stack.pop().unwrap_or(Value::Null));
            };
            self.tracer.on_instruction(ip, op, self.stack.len() - self.current_frame().base, self.frames.len());

            match self.step(op)? {
                StepResult::Continue => {}
                StepResult::Returned(value) => {
                    if self.frames.len() <= target_depth {
                        return Ok(value);
                    }
                }
            }
        }
    }

    /// Fetches the next opcode for the topmost frame, returning its byte
    /// offset (for tracing) alongside the decoded opcode.
    fn fetch_opcode(&mut self) -> Option<(usize, Opcode)> {
        let frame = self.frames.last()?;
        let closure = self.closure_of(frame.closure);
        let function = self.heap.get(closure.function);
        let HeapData::Function(function) = function else { unreachable!("closure always points to a function") };
        if frame.ip >= function.chunk.code.len() {
            return None;
        }
        let ip = frame.ip;
        // SAFETY net: `Opcode` is `#[repr(u8)]` with every discriminant in
        // `0..opcode count` produced only by `ChunkBuilder::emit`, so any
        // byte written by the compiler round-trips through `transmute`.
        let byte = function.chunk.code[frame.ip];
        self.frames.last_mut().unwrap().ip += 1;
        Some((ip, unsafe { std::mem::transmute::<u8, Opcode>(byte) }))
    }

    fn closure_of(&self, id: HeapId) -> &PyroClosure {
        match self.heap.get(id) {
            HeapData::Closure(c) => c,
            _ => unreachable!("frame.closure always references a Closure"),
        }
    }

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("instruction executing outside any call frame")
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let closure = match self.heap.get(frame.closure) {
            HeapData::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let HeapData::Function(function) = self.heap.get(closure) else { unreachable!() };
        let byte = function.chunk.code[frame.ip];
        self.frames.last_mut().unwrap().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let lo = self.read_u8();
        let hi = self.read_u8();
        u16::from_le_bytes([lo, hi])
    }

    fn current_line(&self) -> u32 {
        let frame = self.current_frame();
        let closure = self.closure_of(frame.closure);
        let HeapData::Function(function) = self.heap.get(closure.function) else { unreachable!() };
        function.chunk.lines.line_for_offset(frame.ip.saturating_sub(1))
    }

    fn current_source(&self) -> crate::loc::SourceId {
        let frame = self.current_frame();
        let closure = self.closure_of(frame.closure);
        let HeapData::Function(function) = self.heap.get(closure.function) else { unreachable!() };
        function.source_id
    }

    fn panic_here(&self, kind: PanicKind, message: impl Into<String>) -> Panic {
        Panic::new(kind, message).at(self.current_source(), self.current_line())
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("VM stack underflow: compiler emitted unbalanced pops")
    }

    fn peek(&self, back: usize) -> Value {
        self.stack[self.stack.len() - 1 - back]
    }

    /// Closes every open upvalue whose captured slot is at or above
    /// `from_stack_index`, copying the value out of the stack into the
    /// heap-allocated `PyroUpvalue` so it survives the frame popping
    /// (spec.md §4.2's closures outliving their defining call).
    fn close_upvalues_from(&mut self, from_stack_index: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let id = self.open_upvalues[i];
            let HeapData::Upvalue(up) = self.heap.get(id) else { unreachable!() };
            let UpvalueState::Open { stack_index } = up.state else { unreachable!("open_upvalues only holds open ones") };
            if stack_index >= from_stack_index {
                let value = self.stack[stack_index];
                if let HeapData::Upvalue(up) = self.heap.get_mut(id) {
                    up.state = UpvalueState::Closed { value };
                }
                self.open_upvalues.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn capture_upvalue(&mut self, stack_index: usize) -> HeapId {
        for &id in &self.open_upvalues {
            let HeapData::Upvalue(up) = self.heap.get(id) else { unreachable!() };
            if let UpvalueState::Open { stack_index: idx } = up.state
                && idx == stack_index
            {
                return id;
            }
        }
        let id = self.heap.alloc(HeapData::Upvalue(crate::objects::PyroUpvalue { state: UpvalueState::Open { stack_index } }));
        self.open_upvalues.push(id);
        id
    }

    /// Calls `value` with no arguments and drives it to completion. Used by
    /// the embedding layer (`embed::Vm::run_main`, `$test_*`/`$time_*`
    /// runners) to invoke a top-level closure after the script that defined
    /// it has already returned, without re-entering `run_until` recursively
    /// from outside the `vm` module (`call_value`/`call_closure` are
    /// `pub(super)`, scoped to this module and its submodules).
    pub(crate) fn call_value_to_completion(&mut self, value: Value) -> RunResult<Value> {
        let depth = self.frames.len();
        self.push(value);
        self.call_value(0)?;
        self.run_until(depth)
    }

    /// Every global whose interned name starts with `prefix`, with the
    /// prefix stripped, sorted by name for reproducible iteration order
    /// (`AHashMap` iteration order is not stable run-to-run). Used by
    /// `embed::Vm::run_test_functions`/`run_time_functions` to find
    /// `$test_*`/`$time_*` globals (spec.md's CLI `test`/`time` subcommand
    /// convention, `examples/original_source/src/cli/main.c`).
    pub(crate) fn globals_with_prefix(&self, prefix: &str) -> Vec<(String, Value)> {
        let mut found: Vec<(String, Value)> = self
            .globals
            .iter()
            .filter_map(|(k, v)| self.heap.str_bytes(*k).strip_prefix(prefix).map(|rest| (rest.to_string(), *v)))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Builds the `Error` value a caught panic becomes inside `try EXPR`
    /// (spec.md §4.4): message is the panic text, `details` carries
    /// `source`/`line` the way `examples/original_source/`'s `PyroErr`
    /// stores its originating panic's location.
    pub(super) fn make_error_value(&mut self, panic: &Panic) -> Value {
        let message = self.heap.intern_str(&panic.message);
        let mut details = crate::objects::PyroMap::new(false);
        if let Some(source_id) = panic.source_id {
            let key = Value::Obj(self.heap.intern_str("source"));
            let value = Value::Obj(source_id.as_heap_id());
            details.insert(key.raw_hash(&self.heap), key, value, |a, b| a.raw_eq(&b));
        }
        if let Some(line) = panic.line {
            let key = Value::Obj(self.heap.intern_str("line"));
            let value = Value::I64(i64::from(line));
            details.insert(key.raw_hash(&self.heap), key, value, |a, b| a.raw_eq(&b));
        }
        let error = crate::objects::PyroError { message, details };
        Value::Obj(self.heap.alloc(HeapData::Error(error)))
    }
}

pub(crate) enum StepResult {
    Continue,
    Returned(Value),
}

/// The capability surface a native function body runs against: heap access
/// only, no call-frame/stack manipulation and no `ResourceTracker` (spec.md
/// §1 scopes native registration to "read source text, register names,
/// resolve imports" — not arbitrary VM control). A native can allocate
/// values and inspect/mutate the objects its arguments reference, but
/// cannot itself invoke a Pyro closure (`native.rs` documents this as a
/// known limitation: no callback-taking natives like a custom sort
/// comparator).
pub struct NativeContext<'a> {
    heap: &'a mut Heap,
}

impl<'a> NativeContext<'a> {
    /// Exposed for `native.rs`'s own tests, which exercise native function
    /// bodies directly rather than by driving a full `CallValue` dispatch.
    pub(crate) fn new(heap: &'a mut Heap) -> Self {
        Self { heap }
    }

    #[must_use]
    pub fn heap(&self) -> &Heap {
        self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        self.heap
    }
}
