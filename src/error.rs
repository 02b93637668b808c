//! Panics: Pyro's sole runtime-error mechanism (spec.md §4.3, §4.4).
//!
//! Grounded on the teacher's `exception_private.rs` (`strum`-derived error
//! taxonomy, `RunResult<T>` alias) — the taxonomy itself is Pyro's own
//! (there is no Python exception class hierarchy to mirror; a panic either
//! becomes an `Error` value inside a `try` or unwinds the VM), but the
//! "one `strum::Display`/`EnumString` enum plus a struct carrying
//! message/location" shape is the teacher's.

use std::fmt;

use strum::{Display, EnumString};

use crate::loc::SourceId;

/// Result type alias for VM operations that can panic.
pub type RunResult<T> = Result<T, Panic>;

/// A coarse classification of what kind of panic occurred. Exposed mainly
/// for diagnostics (`StderrTracer`, test assertions on panic shape) — the
/// language itself does not branch on this inside `try` the way Python
/// branches on exception type; `try` always produces one `Error` value
/// regardless of kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum PanicKind {
    /// Lexer/compiler syntax error. Always carries a `source_id`/`line`
    /// even when no call frame exists yet (spec.md §4.2, §4.3).
    SyntaxError,
    /// Wrong argument count, after default-argument filling (spec.md §4.3).
    ArityError,
    /// Operand of the wrong type for an operator, index, or call.
    TypeError,
    /// Right type, but an invalid value (e.g. division by zero, a negative
    /// repeat count).
    ValueError,
    /// Reference to an undefined local, global, field, or module member.
    NameError,
    /// Index out of bounds on a vector/tuple/string/buffer.
    IndexError,
    /// Key not present in a map/set lookup that requires one.
    KeyError,
    /// `import` could not locate or load the requested module.
    ImportError,
    /// Operation attempted on a closed file, or other "resource already
    /// released" condition (spec.md §5: "shared resources").
    IoError,
    /// `assert` failed.
    AssertionError,
    /// Allocation would exceed a configured resource limit (spec.md §9's
    /// resource-limit note) or the heap allocator itself failed.
    OutOfMemory,
    /// Recursion/call-stack depth exceeded a configured limit.
    RecursionError,
    /// Catch-all for user code explicitly panicking with a message (native
    /// functions, `$fmt`/`$hash` implementations that choose to panic).
    Custom,
}

/// A single panic: what kind, a human-readable message, and where it
/// happened. The VM's panic buffer holds at most one of these at a time —
/// a panic during panic propagation is suppressed (spec.md §4.3: "a second
/// panic during panic propagation is suppressed; only the first is
/// reported").
#[derive(Debug, Clone)]
pub struct Panic {
    pub kind: PanicKind,
    pub message: String,
    pub source_id: Option<SourceId>,
    pub line: Option<u32>,
}

impl Panic {
    #[must_use]
    pub fn new(kind: PanicKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), source_id: None, line: None }
    }

    #[must_use]
    pub fn at(mut self, source_id: SourceId, line: u32) -> Self {
        self.source_id = Some(source_id);
        self.line = Some(line);
        self
    }

    #[must_use]
    pub fn arity(expected: &str, got: usize) -> Self {
        Self::new(PanicKind::ArityError, format!("expected {expected} argument(s), got {got}"))
    }

    #[must_use]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(PanicKind::TypeError, message.into())
    }

    #[must_use]
    pub fn name_error(name: &str) -> Self {
        Self::new(PanicKind::NameError, format!("'{name}' is not defined"))
    }

    #[must_use]
    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new(PanicKind::IndexError, message.into())
    }

    #[must_use]
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(PanicKind::ValueError, message.into())
    }
}

impl fmt::Display for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(line) = self.line {
            write!(f, "{}: {} (line {line})", self.kind, self.message)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for Panic {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_line_when_present() {
        let p = Panic::type_error("expected a string").at(SourceId(crate::heap::Heap::new().intern_str("main")), 3);
        assert!(p.to_string().contains("line 3"));
    }
}
