//! `Opcode::ImportModule`/`ImportNamedMembers` execution (spec.md §4.7).
//!
//! Resolution and caching are `imports::ImportResolver`'s job; this module
//! drives it and turns a resolved `.pyro` file into a `HeapData::Module`.
//! The compiler has no separate notion of "compiling a module body" versus
//! "compiling the main script" — every top-level `var`/`def`/`class`
//! statement always emits ordinary `DefinePubGlobal`-targeting bytecode, the
//! same as it would at the top of any script. Rather than invent a second
//! binding opcode path just for modules, a module's body runs with
//! `self.globals` swapped out for a fresh, empty table (mirroring
//! `op_try`'s own swap-in/run/swap-back shape for a synthetic closure), and
//! everything the swapped-in table ends up holding becomes that module's
//! member table. Every such member counts as public, since the compiler
//! never emits `DefinePriGlobal` at the top level today; a module's bindings
//! land back in `self.globals` (process-wide) once restored, same as the
//! importing script's own globals, rather than in any lexical scope —
//! `import` is a statement, not an expression with a block (spec.md §4.7 is
//! silent on lexical scoping here; see DESIGN.md).

use ahash::AHashMap;

use crate::{
    compiler::Compiler,
    error::{Panic, PanicKind, RunResult},
    heap::{HeapData, HeapId},
    imports::Resolved,
    loc::SourceId,
    objects::{PyroClosure, PyroModule},
    resource::ResourceTracker,
    value::Value,
};

use super::Vm;

impl<T: ResourceTracker> Vm<T> {
    pub(super) fn exec_import_module(&mut self, segments: &[HeapId]) -> Result<(), Panic> {
        let names = self.segment_names(segments);
        let module_id = self.load_module(&names)?;
        let binding = *segments.last().expect("import always names at least one segment");
        self.bind_global(binding, Value::Obj(module_id))
    }

    pub(super) fn exec_import_named_members(&mut self, segments: &[HeapId], members: &[HeapId]) -> Result<(), Panic> {
        let names = self.segment_names(segments);
        let module_id = self.load_module(&names)?;
        for &member in members {
            let HeapData::Module(m) = self.heap.get(module_id) else { unreachable!("load_module always yields a Module") };
            let Some(&idx) = m.pub_member_indexes.get(&member) else {
                let message = format!("module '{}' has no public member '{}'", names.join("::"), self.heap.str_bytes(member));
                return Err(self.panic_here(PanicKind::NameError, message));
            };
            let value = m.members[idx as usize];
            self.bind_global(member, value)?;
        }
        Ok(())
    }

    fn segment_names(&self, segments: &[HeapId]) -> Vec<String> {
        segments.iter().map(|&id| self.heap.str_bytes(id).to_string()).collect()
    }

    fn bind_global(&mut self, name: HeapId, value: Value) -> Result<(), Panic> {
        if self.globals.contains_key(&name) {
            return Err(self.global_redefinition_error(name));
        }
        self.globals.insert(name, value);
        Ok(())
    }

    /// Resolves and (on a cache miss) runs `names`' module body, returning
    /// its `HeapData::Module`. A dylib candidate panics here: core `Vm` has
    /// no way to drive `imports::DylibModuleLoader::load`, whose signature
    /// takes `&mut embed::Vm` directly — only the embedding layer can load
    /// one (`embed.rs` keeps its own `module_loader` for that reason).
    fn load_module(&mut self, names: &[String]) -> Result<HeapId, Panic> {
        let dotted_path = names.join("::");
        if let Some(id) = self.resolver.cached(&dotted_path) {
            return Ok(id);
        }
        let segments: Vec<&str> = names.iter().map(String::as_str).collect();
        let resolved = self.resolver.resolve(&segments, self.source_loader.as_ref())?;
        let (path, bytes) = match resolved {
            Resolved::Source { path, bytes } => (path, bytes),
            Resolved::Dylib { .. } => {
                let message = format!("module '{dotted_path}' is a dynamic-library module; only an embedder can load it");
                return Err(self.panic_here(PanicKind::ImportError, message));
            }
        };
        self.resolver.mark_pending(&dotted_path);
        match self.run_module_body(&dotted_path, &path, &bytes) {
            Ok(module_id) => {
                self.resolver.commit(&dotted_path, module_id);
                Ok(module_id)
            }
            Err(panic) => {
                self.resolver.rollback(&dotted_path);
                Err(panic)
            }
        }
    }

    fn run_module_body(&mut self, dotted_path: &str, path: &std::path::Path, bytes: &[u8]) -> Result<HeapId, Panic> {
        let source = String::from_utf8(bytes.to_vec())
            .map_err(|_| Panic::new(PanicKind::ImportError, format!("module '{dotted_path}' is not valid UTF-8")))?;
        let source_name = path.to_string_lossy().into_owned();
        let source_id = SourceId(self.heap.intern_str(&source_name));
        let script_fn = Compiler::compile(&source, source_id, &mut self.heap)?;

        let saved_globals = std::mem::take(&mut self.globals);
        let depth = self.frames.len();
        let closure_data =
            PyroClosure { function: script_fn, upvalues: Default::default(), module: self.main_module, is_default_value_expr: false };
        let closure = self.heap.alloc(HeapData::Closure(closure_data));
        self.push(Value::Obj(closure));
        let result: RunResult<()> = self.call_closure(closure, 0).and_then(|()| self.run_until(depth).map(|_| ()));
        let module_globals = std::mem::replace(&mut self.globals, saved_globals);
        result?;

        let module_name = self.heap.intern_str(dotted_path);
        let mut members = Vec::with_capacity(module_globals.len());
        let mut all_member_indexes = AHashMap::new();
        let mut pub_member_indexes = AHashMap::new();
        for (name, value) in module_globals {
            let idx = u16::try_from(members.len()).expect("module member table exceeds 65536 entries");
            members.push(value);
            all_member_indexes.insert(name, idx);
            pub_member_indexes.insert(name, idx);
        }
        let module = PyroModule { name: module_name, members, all_member_indexes, pub_member_indexes };
        Ok(self.heap.alloc(HeapData::Module(module)))
    }
}
