//! The public embedding surface (spec.md §6): construct a `Vm`, feed it
//! source, drive it to completion, inspect what happened. Mirrors the
//! teacher's `Runner`/`run.rs` embedding shape — construct, feed source,
//! drive to completion, inspect exit/panic state — trimmed to Pyro's
//! synchronous model (spec.md §5: no suspension points, so none of the
//! teacher's `Snapshot`/resumption machinery applies).
//!
//! This wraps [`crate::vm::Vm`] (the generic interpreter, parameterized over
//! `ResourceTracker`) concretely over [`LimitedTracker`], rather than
//! re-exporting `vm::Vm<T>` itself at the crate root — a fixed, ungeneric
//! `embed::Vm` is what an embedder actually constructs.

use std::path::{Path, PathBuf};

use crate::{
    compiler::Compiler,
    error::{Panic, PanicKind, RunResult},
    heap::{HeapData, HeapId, HeapStats},
    imports::{DylibModuleLoader, SourceLoader},
    loc::SourceId,
    objects::{NativeFnPtr, PyroNativeFn},
    resource::{LimitedTracker, ResourceLimits, ResourceTracker},
    tracer::{NoopTracer, VmTracer},
    value::Value,
    vm::Vm as CoreVm,
};

/// What a `main`/`$test_*`/`$time_*` invocation, or a top-level `exec_str`/
/// `exec_file`, ended with: either the value the script produced, or the
/// panic that unwound it (spec.md §4.3 — a panic is Pyro's only runtime
/// error mechanism, so there is no third "partial success" case).
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    Completed(Value),
    Panicked(Panic),
}

impl ExecOutcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecOutcome::Completed(_))
    }

    #[must_use]
    pub fn panic(&self) -> Option<&Panic> {
        match self {
            ExecOutcome::Panicked(p) => Some(p),
            ExecOutcome::Completed(_) => None,
        }
    }
}

/// One `$test_*` function's outcome, per spec.md's CLI `test` subcommand
/// convention (`examples/original_source/src/cli/main.c`'s
/// `pyro_run_test_funcs`). `name` has the `$test_` prefix stripped.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub panic: Option<Panic>,
}

/// One `$time_*` function's wall-clock duration, per the CLI `time`
/// subcommand convention. `name` has the `$time_` prefix stripped.
#[derive(Debug, Clone)]
pub struct TimingResult {
    pub name: String,
    pub elapsed: std::time::Duration,
}

/// Construction-time knobs for [`Vm::new`]: resource limits and which
/// tracer (if any) observes execution (spec.md §6, `tracer.rs`).
pub struct VmConfig {
    pub limits: ResourceLimits,
    pub tracer: Box<dyn VmTracer>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self { limits: ResourceLimits::default(), tracer: Box::new(NoopTracer) }
    }
}

/// An embedded Pyro interpreter: one heap, one value stack, one set of
/// superglobals — "the VM is a single process-wide value passed explicitly"
/// (spec.md §9). Construct with [`Vm::new`], feed it source with
/// `exec_str`/`exec_file`, then inspect [`Vm::is_panicked`]/[`Vm::exit_code`].
pub struct Vm {
    inner: CoreVm<LimitedTracker>,
    /// Only a dylib-loading embedder needs this one at the `embed` layer:
    /// `DylibModuleLoader::load` takes `&mut embed::Vm` directly, so core
    /// `vm::Vm::step` can never drive it itself — `resolver`/`source_loader`
    /// live on the core VM instead (spec.md §4.7, `imports.rs`).
    module_loader: Option<Box<dyn DylibModuleLoader>>,
    args: Vec<String>,
    last_panic: Option<Panic>,
}

impl Vm {
    #[must_use]
    pub fn new(config: VmConfig) -> Self {
        let mut inner = CoreVm::with_tracker(LimitedTracker::new(config.limits));
        inner.set_tracer(config.tracer);
        Self { inner, module_loader: None, args: Vec::new(), last_panic: None }
    }

    /// The `HeapId` of the synthetic module every top-level script and
    /// `def`/`class` it defines belongs to — the natural target for
    /// `define_pub_member`/`define_native_fn` when an embedder has no more
    /// specific module in hand (e.g. before any `import` has run).
    #[must_use]
    pub fn main_module(&self) -> HeapId {
        self.inner.main_module_id()
    }

    pub fn set_args(&mut self, args: Vec<String>) {
        self.args = args;
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn add_import_root(&mut self, root: impl Into<PathBuf>) {
        self.inner.add_import_root(root);
    }

    pub fn set_source_loader(&mut self, loader: Box<dyn SourceLoader>) {
        self.inner.set_source_loader(loader);
    }

    pub fn set_module_loader(&mut self, loader: Box<dyn DylibModuleLoader>) {
        self.module_loader = Some(loader);
    }

    /// Compiles and runs `src` as a top-level script named `source_id`
    /// (used for panic tracebacks, not a filesystem path). A syntax error
    /// and a runtime panic are both reported the same way (spec.md §4.3:
    /// the compiler's own errors are just panics raised before the first
    /// opcode runs).
    pub fn exec_str(&mut self, source_id: &str, src: &str) -> ExecOutcome {
        let sid = SourceId(self.inner.heap.intern_str(source_id));
        let result = match Compiler::compile(src, sid, &mut self.inner.heap) {
            Ok(script_fn) => self.inner.run_script(script_fn),
            Err(panic) => Err(panic),
        };
        self.record(result)
    }

    pub fn exec_file(&mut self, path: &Path) -> ExecOutcome {
        let src = match std::fs::read_to_string(path) {
            Ok(src) => src,
            Err(io_err) => {
                let panic = Panic::new(PanicKind::IoError, format!("unable to read '{}': {io_err}", path.display()));
                return self.record(Err(panic));
            }
        };
        self.exec_str(&path.to_string_lossy(), &src)
    }

    /// Calls the global `main` function with no arguments, if one is
    /// defined; a no-op otherwise. `exec_str`/`exec_file` already ran the
    /// script's top-level statements, so this is for embedders whose script
    /// is all `def`/`class` declarations plus one `main()` entry point
    /// (Open Question — see DESIGN.md).
    pub fn run_main(&mut self) -> ExecOutcome {
        let Some(main_fn) = self.inner.get_global("main") else {
            return ExecOutcome::Completed(Value::Null);
        };
        let result = self.inner.call_value_to_completion(main_fn);
        self.record(result)
    }

    pub fn run_test_functions(&mut self) -> Vec<TestResult> {
        self.inner
            .globals_with_prefix("$test_")
            .into_iter()
            .map(|(name, value)| match self.inner.call_value_to_completion(value) {
                Ok(_) => TestResult { name, passed: true, panic: None },
                Err(panic) => TestResult { name, passed: false, panic: Some(panic) },
            })
            .collect()
    }

    pub fn run_time_functions(&mut self) -> Vec<TimingResult> {
        self.inner
            .globals_with_prefix("$time_")
            .into_iter()
            .map(|(name, value)| {
                let start = std::time::Instant::now();
                let _ = self.inner.call_value_to_completion(value);
                TimingResult { name, elapsed: start.elapsed() }
            })
            .collect()
    }

    pub fn define_superglobal(&mut self, name: &str, value: Value) {
        self.inner.define_global(name, value);
    }

    /// Reads back a global by name — the counterpart to `define_superglobal`
    /// for an embedder (or a test) that needs to observe state a script
    /// mutated rather than relying on `echo`'s direct-to-stdout output.
    #[must_use]
    pub fn global(&self, name: &str) -> Option<Value> {
        self.inner.get_global(name)
    }

    pub fn define_pub_member(&mut self, module: HeapId, name: &str, value: Value) {
        define_module_member(&mut self.inner, module, name, value, true);
    }

    pub fn define_priv_member(&mut self, module: HeapId, name: &str, value: Value) {
        define_module_member(&mut self.inner, module, name, value, false);
    }

    pub fn define_native_fn(&mut self, module: HeapId, name: &str, arity: i32, f: NativeFnPtr) {
        let name_id = self.inner.heap.intern_str(name);
        let native = PyroNativeFn { name: name_id, arity, func: f, is_method: false };
        let native_id = self.inner.heap.alloc(HeapData::NativeFn(native));
        define_module_member(&mut self.inner, module, name, Value::Obj(native_id), true);
    }

    pub fn define_pub_method(&mut self, class: HeapId, name: &str, arity: i32, f: NativeFnPtr) {
        define_class_method(&mut self.inner, class, name, arity, f, true);
    }

    pub fn define_priv_method(&mut self, class: HeapId, name: &str, arity: i32, f: NativeFnPtr) {
        define_class_method(&mut self.inner, class, name, arity, f, false);
    }

    #[must_use]
    pub fn is_panicked(&self) -> bool {
        self.last_panic.is_some()
    }

    #[must_use]
    pub fn panic(&self) -> Option<&Panic> {
        self.last_panic.as_ref()
    }

    /// Always `false`: no `exit()`/`$exit` builtin is wired up yet (spec.md
    /// §5's `halt_flag`, combined from `exit_flag`/`panic_flag`, is
    /// implemented for panics only — see DESIGN.md's known limitations).
    #[must_use]
    pub fn is_exited(&self) -> bool {
        false
    }

    /// `1` if the last `exec_str`/`exec_file`/`run_main` panicked, `0`
    /// otherwise — matches spec.md §8's end-to-end scenarios ("exit 0"/
    /// "exit 1" tied directly to whether the run panicked).
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(self.is_panicked())
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.inner.heap.stats()
    }

    fn record(&mut self, result: RunResult<Value>) -> ExecOutcome {
        match result {
            Ok(value) => {
                self.last_panic = None;
                ExecOutcome::Completed(value)
            }
            Err(panic) => {
                self.last_panic = Some(panic.clone());
                ExecOutcome::Panicked(panic)
            }
        }
    }
}

/// Inserts or overwrites a named module member, reusing the existing slot
/// on a repeat registration rather than leaking a stale duplicate (same
/// "reuse index on override" idiom `call.rs`'s `op_define_field` uses for
/// `Inherit`-copied fields).
fn define_module_member<T: ResourceTracker>(vm: &mut CoreVm<T>, module: HeapId, name: &str, value: Value, is_pub: bool) {
    let name_id = vm.heap.intern_str(name);
    let HeapData::Module(m) = vm.heap.get_mut(module) else { panic!("define_module_member: target is not a module") };
    if let Some(&idx) = m.all_member_indexes.get(&name_id) {
        m.members[idx as usize] = value;
    } else {
        let idx = u16::try_from(m.members.len()).expect("module member table exceeds 65536 entries");
        m.members.push(value);
        m.all_member_indexes.insert(name_id, idx);
    }
    if is_pub {
        let idx = m.all_member_indexes[&name_id];
        m.pub_member_indexes.insert(name_id, idx);
    }
}

fn define_class_method<T: ResourceTracker>(vm: &mut CoreVm<T>, class: HeapId, name: &str, arity: i32, f: NativeFnPtr, is_pub: bool) {
    let name_id = vm.heap.intern_str(name);
    let native = PyroNativeFn { name: name_id, arity, func: f, is_method: true };
    let native_id = vm.heap.alloc(HeapData::NativeFn(native));
    let HeapData::Class(c) = vm.heap.get_mut(class) else { panic!("define_class_method: target is not a class") };
    c.all_instance_methods.insert(name_id, native_id);
    if is_pub {
        c.pub_instance_methods.insert(name_id, native_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_str_runs_a_script_and_reports_success() {
        let mut vm = Vm::new(VmConfig::default());
        let outcome = vm.exec_str("main", "echo 1 + 2;");
        assert!(outcome.is_ok());
        assert!(!vm.is_panicked());
        assert_eq!(vm.exit_code(), 0);
    }

    #[test]
    fn exec_file_reports_a_panic_for_a_missing_path() {
        let mut vm = Vm::new(VmConfig::default());
        let outcome = vm.exec_file(Path::new("/no/such/file.pyro"));
        assert!(!outcome.is_ok());
        assert!(vm.is_panicked());
        assert_eq!(vm.exit_code(), 1);
    }

    #[test]
    fn run_main_is_a_no_op_without_a_main_global() {
        let mut vm = Vm::new(VmConfig::default());
        vm.exec_str("main", "var x = 1;");
        let outcome = vm.run_main();
        assert!(outcome.is_ok());
    }

    #[test]
    fn run_test_functions_collects_pass_and_fail() {
        let mut vm = Vm::new(VmConfig::default());
        vm.exec_str(
            "main",
            "def $test_pass() { assert 1 == 1; } def $test_fail() { assert 1 == 2; }",
        );
        let results = vm.run_test_functions();
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|r| r.name == "pass" && r.passed));
        assert!(results.iter().any(|r| r.name == "fail" && !r.passed));
    }

    #[test]
    fn define_superglobal_is_visible_to_a_script() {
        let mut vm = Vm::new(VmConfig::default());
        vm.define_superglobal("answer", Value::I64(42));
        let outcome = vm.exec_str("main", "echo answer;");
        assert!(outcome.is_ok());
    }
}
