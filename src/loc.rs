//! Source identity and line tracking shared by the lexer, compiler, and VM.
//!
//! Grounded on the teacher's `parse::CodeRange` (a span used to annotate AST
//! nodes for tracebacks): same idea, shrunk to what a token-stream compiler
//! with no AST actually needs — an interned source identifier and a line
//! number, not a byte-range span over a tree.
//!
//! Source names are interned directly as heap strings rather than through a
//! separate compile-time symbol table: the compiler already holds a `&mut
//! Heap` to emit string constants, so giving it a second interner would just
//! be two tables that have to agree with each other. `Heap::intern_str`
//! is the one interning mechanism for the whole crate.

use std::fmt;

use crate::heap::HeapId;

/// Interned identifier for a source unit (the main module, or one imported
/// module), so every `Token`/`Panic` can carry a cheap `Copy` id instead of
/// an owned path string. Resolved back to text via `Heap::str_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub HeapId);

impl SourceId {
    #[must_use]
    pub fn as_heap_id(self) -> HeapId {
        self.0
    }
}

/// A single source location: which file, which line. Lines are 1-based and
/// count LF or CRLF terminated lines, per spec.md §6 ("Line endings LF or
/// CRLF; line numbers count source lines").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLoc {
    pub source_id: SourceId,
    pub line: u32,
}

impl SourceLoc {
    #[must_use]
    pub fn new(source_id: SourceId, line: u32) -> Self {
        Self { source_id, line }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id.0.index(), self.line)
    }
}
