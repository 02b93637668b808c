//! Module import resolution (spec.md §6's `SourceLoader`/`DylibModuleLoader`
//! collaborators).
//!
//! Grounded on `examples/original_source/src/core/imports.c`: given
//! `import foo::bar::baz`, candidates are tried in a fixed order under each
//! configured root — a dynamic-library module first, then a `.pyro` file,
//! then a `self.pyro` file inside a same-named directory — and the first
//! root where *any* candidate exists wins, even if that specific candidate
//! turns out to fail to load. Cache entries are inserted tentatively before
//! the module body runs and removed again if loading panics, so a module
//! that only partially initialized before panicking is never mistaken for
//! a cached success on a later `import` of the same path.
//!
//! `ImportResolver` and the default `FsSourceLoader` live on the core
//! `vm::Vm`, driven by `vm/import.rs`'s `Opcode::ImportModule`/
//! `ImportNamedMembers` handlers. `DylibModuleLoader` stays embedder-only:
//! its `load` signature takes `&mut crate::embed::Vm` directly, so a
//! dylib-backed import is only reachable when running under `embed::Vm`
//! (spec.md §6) — resolving one from the core crate panics with
//! `PanicKind::ImportError`.

use std::path::{Path, PathBuf};

use ahash::AHashMap;

use crate::{error::Panic, heap::HeapId};

/// Supplies the bytes of a `.pyro` source file for a given dotted import
/// path. `candidate` is the specific filesystem path this call is checking
/// (already joined against one import root); returning `None` means "this
/// candidate doesn't exist here, try the next one" rather than "failed to
/// load" (spec.md §6).
pub trait SourceLoader {
    fn load(&self, dotted_path: &str, candidate: &Path) -> Option<Vec<u8>>;
}

/// Loads a native (dynamic-library) module, populating `module`'s members
/// directly by calling back into the embedding `Vm` (spec.md §6). Pyro's
/// own `.so`/`.dylib` dlopen convention has no safe Rust equivalent the core
/// crate can assume, so this is left entirely to the embedder.
pub trait DylibModuleLoader {
    fn load(&self, path: &Path, module: HeapId, vm: &mut crate::embed::Vm) -> Result<(), String>;
}

/// The default `SourceLoader`: reads candidate paths straight off disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSourceLoader;

impl SourceLoader for FsSourceLoader {
    fn load(&self, _dotted_path: &str, candidate: &Path) -> Option<Vec<u8>> {
        std::fs::read(candidate).ok()
    }
}

/// One filesystem candidate a resolver attempt will probe, in try-order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    Dylib,
    PyroFile,
    PyroSelf,
}

/// Joins an import root and a dotted path (`foo::bar::baz`) into one of the
/// three candidate filesystem paths `imports.c` tries, in order.
fn candidate_path(root: &Path, segments: &[&str], candidate: Candidate) -> PathBuf {
    match candidate {
        Candidate::Dylib => {
            let mut path = root.join(segments.join(std::path::MAIN_SEPARATOR_STR));
            path.set_extension(std::env::consts::DLL_EXTENSION);
            path
        }
        Candidate::PyroFile => {
            let mut path = root.join(segments.join(std::path::MAIN_SEPARATOR_STR));
            path.set_extension("pyro");
            path
        }
        Candidate::PyroSelf => root.join(segments.join(std::path::MAIN_SEPARATOR_STR)).join("self.pyro"),
    }
}

/// What resolving `import foo::bar::baz` found, before its body has run.
pub enum Resolved {
    Source { path: PathBuf, bytes: Vec<u8> },
    Dylib { path: PathBuf },
}

/// Caches modules by dotted import path and walks configured roots to
/// locate new ones. One `ImportResolver` lives on `embed::Vm` (spec.md §6).
#[derive(Debug, Default)]
pub struct ImportResolver {
    roots: Vec<PathBuf>,
    /// `None` while a module's body is mid-execution — a tentative entry
    /// (spec.md's "inserted before running, removed again on failure" so a
    /// re-`import` of the same path during a panic doesn't see a phantom
    /// success).
    cache: AHashMap<String, Option<HeapId>>,
}

impl ImportResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, root: impl Into<PathBuf>) {
        self.roots.push(root.into());
    }

    #[must_use]
    pub fn cached(&self, dotted_path: &str) -> Option<HeapId> {
        self.cache.get(dotted_path).copied().flatten()
    }

    /// Marks `dotted_path` as in-progress, so re-entrant imports (an import
    /// cycle) resolve to "not yet cached" rather than recursing.
    pub fn mark_pending(&mut self, dotted_path: &str) {
        self.cache.insert(dotted_path.to_string(), None);
    }

    pub fn commit(&mut self, dotted_path: &str, module: HeapId) {
        self.cache.insert(dotted_path.to_string(), Some(module));
    }

    /// Removes a tentative entry after the module's body panicked partway
    /// through initialization (spec.md §6).
    pub fn rollback(&mut self, dotted_path: &str) {
        self.cache.remove(dotted_path);
    }

    /// Walks `self.roots` trying, for each root in order: a dynamic-library
    /// candidate, a `name.pyro` file, then a `name/self.pyro` file — the
    /// first root with any hit wins (spec.md §6, `imports.c`'s
    /// `try_load_filesystem_module`).
    pub fn resolve(&self, segments: &[&str], loader: &dyn SourceLoader) -> Result<Resolved, Panic> {
        let dotted_path = segments.join("::");
        for root in &self.roots {
            let dylib_path = candidate_path(root, segments, Candidate::Dylib);
            if dylib_path.is_file() {
                return Ok(Resolved::Dylib { path: dylib_path });
            }
            let file_path = candidate_path(root, segments, Candidate::PyroFile);
            if let Some(bytes) = loader.load(&dotted_path, &file_path) {
                return Ok(Resolved::Source { path: file_path, bytes });
            }
            let self_path = candidate_path(root, segments, Candidate::PyroSelf);
            if let Some(bytes) = loader.load(&dotted_path, &self_path) {
                return Ok(Resolved::Source { path: self_path, bytes });
            }
        }
        Err(Panic::new(
            crate::error::PanicKind::ImportError,
            format!("unable to locate module '{dotted_path}'"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapLoader(AHashMap<PathBuf, Vec<u8>>);

    impl SourceLoader for MapLoader {
        fn load(&self, _dotted_path: &str, candidate: &Path) -> Option<Vec<u8>> {
            self.0.get(candidate).cloned()
        }
    }

    #[test]
    fn resolves_direct_pyro_file_over_self_pyro() {
        let mut resolver = ImportResolver::new();
        resolver.add_root("/root");
        let mut files = AHashMap::new();
        files.insert(PathBuf::from("/root/foo/bar.pyro"), b"echo 1;".to_vec());
        files.insert(PathBuf::from("/root/foo/bar/self.pyro"), b"echo 2;".to_vec());
        let loader = MapLoader(files);
        let resolved = resolver.resolve(&["foo", "bar"], &loader).unwrap();
        match resolved {
            Resolved::Source { bytes, .. } => assert_eq!(bytes, b"echo 1;"),
            Resolved::Dylib { .. } => panic!("expected a source module"),
        }
    }

    #[test]
    fn falls_back_to_self_pyro_when_direct_file_is_absent() {
        let mut resolver = ImportResolver::new();
        resolver.add_root("/root");
        let mut files = AHashMap::new();
        files.insert(PathBuf::from("/root/foo/bar/self.pyro"), b"echo 2;".to_vec());
        let loader = MapLoader(files);
        let resolved = resolver.resolve(&["foo", "bar"], &loader).unwrap();
        match resolved {
            Resolved::Source { bytes, .. } => assert_eq!(bytes, b"echo 2;"),
            Resolved::Dylib { .. } => panic!("expected a source module"),
        }
    }

    #[test]
    fn reports_import_error_when_no_root_has_a_match() {
        let mut resolver = ImportResolver::new();
        resolver.add_root("/root");
        let loader = MapLoader(AHashMap::new());
        let err = resolver.resolve(&["missing"], &loader).unwrap_err();
        assert_eq!(err.kind, crate::error::PanicKind::ImportError);
    }

    #[test]
    fn pending_then_commit_round_trips() {
        let mut resolver = ImportResolver::new();
        resolver.mark_pending("foo::bar");
        assert_eq!(resolver.cached("foo::bar"), None);
        let id = crate::heap::Heap::new().intern_str("placeholder");
        resolver.commit("foo::bar", id);
        assert_eq!(resolver.cached("foo::bar"), Some(id));
    }

    #[test]
    fn rollback_removes_a_tentative_entry() {
        let mut resolver = ImportResolver::new();
        resolver.mark_pending("foo::bar");
        resolver.rollback("foo::bar");
        assert!(!resolver.cache.contains_key("foo::bar"));
    }
}
