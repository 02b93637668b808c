//! Heap object payloads (spec.md §3.2).
//!
//! Every struct here is wrapped by exactly one `HeapData` variant (defined in
//! `heap.rs`, which also owns the arena and the mark/sweep tracer). Grounded
//! on the shape of the teacher's per-type structs under `types/` (e.g.
//! `types::dict::Dict`, `types::deque::Deque`, `types::iter::OurosIter`) —
//! the layouts are Pyro's own (no Python-specific fields survive), but the
//! "plain struct + a handful of inherent methods, heap-aware operations live
//! on `Heap`/the VM" split is the same one the teacher uses throughout.

use smallvec::SmallVec;

use crate::{
    bytecode::Chunk,
    heap::HeapId,
    loc::SourceId,
    value::Value,
};

/// Immutable, interned byte string. Two `PyroStr`s with equal bytes are
/// always the same heap object (spec.md §3.2/§3.3) — the interning itself is
/// enforced by `Heap::intern_str`, not by this struct.
#[derive(Debug, Clone)]
pub struct PyroStr {
    pub bytes: Box<str>,
    pub hash: u64,
}

impl PyroStr {
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Mutable byte sequence.
#[derive(Debug, Clone, Default)]
pub struct PyroBuffer {
    pub bytes: Vec<u8>,
}

/// Fixed-length value array.
#[derive(Debug, Clone)]
pub struct PyroTuple {
    pub values: Box<[Value]>,
}

/// Growable value array. `version` increments on every structural mutation
/// (push/pop/insert/remove/sort/clear/splice) so iterators can detect that
/// the vector they were created over has changed shape (spec.md §3.2's
/// "version counter (for iterator invalidation)"; enforcement policy is
/// resolved in DESIGN.md's open-question ledger: clamp, don't panic).
#[derive(Debug, Clone, Default)]
pub struct PyroVector {
    pub values: Vec<Value>,
    pub version: u64,
}

impl PyroVector {
    pub fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }
}

/// An entry in a `PyroMap`'s dense entry array. `None` marks a tombstone.
pub type MapSlot = Option<(u64, Value, Value)>;

const MAP_EMPTY: i32 = -1;
const MAP_TOMBSTONE: i32 = -2;
const MAP_MAX_LOAD: f64 = 0.75;

/// Open-addressed hash table (spec.md §4.5): a dense `entries` array
/// (insertion order, `None` = tombstone) plus a power-of-two `index` array
/// mapping `hash & (capacity - 1)` probe slots to entry-array positions.
/// `MAP_AS_SET` mode stores `Value::Null` in the value slot of every entry
/// and is otherwise identical code, matching spec.md's "the entry still
/// stores a value slot... so insertion, lookup, and iteration share code".
#[derive(Debug, Clone)]
pub struct PyroMap {
    index: Vec<i32>,
    entries: Vec<MapSlot>,
    live_entry_count: usize,
    tombstone_count: usize,
    pub is_set: bool,
}

impl Default for PyroMap {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PyroMap {
    #[must_use]
    pub fn new(is_set: bool) -> Self {
        Self {
            index: Vec::new(),
            entries: Vec::new(),
            live_entry_count: 0,
            tombstone_count: 0,
            is_set,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live_entry_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_entry_count == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.index.len()
    }

    fn ensure_capacity(&mut self) {
        if self.index.is_empty() {
            self.rebuild(8);
            return;
        }
        let used = self.live_entry_count + self.tombstone_count + 1;
        if used as f64 > self.index.len() as f64 * MAP_MAX_LOAD {
            let new_cap = if self.live_entry_count as f64 > (self.index.len() as f64 * MAP_MAX_LOAD / 2.0) {
                self.index.len() * 2
            } else {
                self.index.len()
            };
            self.rebuild(new_cap.max(8));
        }
    }

    fn rebuild(&mut self, new_capacity: usize) {
        debug_assert!(new_capacity.is_power_of_two());
        let old_entries = std::mem::take(&mut self.entries);
        self.index = vec![MAP_EMPTY; new_capacity];
        self.entries = Vec::with_capacity(new_capacity);
        self.live_entry_count = 0;
        self.tombstone_count = 0;
        for slot in old_entries.into_iter().flatten() {
            let (hash, key, value) = slot;
            self.insert_fresh(hash, key, value);
        }
    }

    fn insert_fresh(&mut self, hash: u64, key: Value, value: Value) {
        let mask = self.index.len() - 1;
        let mut i = (hash as usize) & mask;
        loop {
            if self.index[i] == MAP_EMPTY {
                self.index[i] = self.entries.len() as i32;
                self.entries.push(Some((hash, key, value)));
                self.live_entry_count += 1;
                return;
            }
            i = (i + 1) & mask;
        }
    }

    /// Finds the probe slot for `key` (under `eq`, raw value equality by
    /// default) returning `Some(entries index)` on hit.
    fn find(&self, hash: u64, key: Value, eq: impl Fn(Value, Value) -> bool) -> Option<usize> {
        if self.index.is_empty() {
            return None;
        }
        let mask = self.index.len() - 1;
        let mut i = (hash as usize) & mask;
        loop {
            match self.index[i] {
                MAP_EMPTY => return None,
                MAP_TOMBSTONE => {}
                slot => {
                    let idx = slot as usize;
                    if let Some((h, k, _)) = &self.entries[idx]
                        && *h == hash
                        && eq(*k, key)
                    {
                        return Some(idx);
                    }
                }
            }
            i = (i + 1) & mask;
        }
    }

    #[must_use]
    pub fn get(&self, hash: u64, key: Value, eq: impl Fn(Value, Value) -> bool) -> Option<Value> {
        self.find(hash, key, eq).map(|idx| self.entries[idx].as_ref().unwrap().2)
    }

    #[must_use]
    pub fn contains(&self, hash: u64, key: Value, eq: impl Fn(Value, Value) -> bool) -> bool {
        self.find(hash, key, eq).is_some()
    }

    /// Inserts or overwrites. Returns `true` if this was a fresh insertion.
    pub fn insert(&mut self, hash: u64, key: Value, value: Value, eq: impl Fn(Value, Value) -> bool) -> bool {
        self.ensure_capacity();
        if let Some(idx) = self.find(hash, key, &eq) {
            self.entries[idx] = Some((hash, key, value));
            return false;
        }
        let mask = self.index.len() - 1;
        let mut i = (hash as usize) & mask;
        loop {
            if matches!(self.index[i], MAP_EMPTY | MAP_TOMBSTONE) {
                self.index[i] = self.entries.len() as i32;
                self.entries.push(Some((hash, key, value)));
                self.live_entry_count += 1;
                return true;
            }
            i = (i + 1) & mask;
        }
    }

    pub fn remove(&mut self, hash: u64, key: Value, eq: impl Fn(Value, Value) -> bool) -> Option<Value> {
        if self.index.is_empty() {
            return None;
        }
        let mask = self.index.len() - 1;
        let mut i = (hash as usize) & mask;
        loop {
            match self.index[i] {
                MAP_EMPTY => return None,
                MAP_TOMBSTONE => {}
                slot => {
                    let idx = slot as usize;
                    if let Some((h, k, v)) = self.entries[idx]
                        && h == hash
                        && eq(k, key)
                    {
                        self.index[i] = MAP_TOMBSTONE;
                        self.entries[idx] = None;
                        self.live_entry_count -= 1;
                        self.tombstone_count += 1;
                        return Some(v);
                    }
                }
            }
            i = (i + 1) & mask;
        }
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.entries.clear();
        self.live_entry_count = 0;
        self.tombstone_count = 0;
    }

    /// Iterates live entries in insertion order, skipping tombstones.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter_map(|slot| slot.map(|(_, k, v)| (k, v)))
    }

    pub(crate) fn trace_values(&self) -> impl Iterator<Item = &Value> + '_ {
        self.entries.iter().filter_map(|slot| slot.as_ref()).flat_map(|(_, k, v)| [k, v])
    }
}

/// Singly-linked FIFO. Modeled as a `VecDeque` internally (constant-time
/// push-back/pop-front either way); the spec's "singly-linked" wording
/// describes the reference C implementation's storage, not an observable
/// property, so this stays an implementation detail.
#[derive(Debug, Clone, Default)]
pub struct PyroQueue {
    pub items: std::collections::VecDeque<Value>,
}

/// A file handle. `None` once closed; closing twice is a no-op (spec.md §8).
#[derive(Debug)]
pub struct PyroFile {
    pub handle: Option<std::fs::File>,
    pub path: Option<Box<str>>,
}

/// What a built-in `Iterator` walks and how far it has gotten.
#[derive(Debug, Clone)]
pub enum IterKind {
    Vector { source: HeapId, index: usize, version_seen: u64 },
    MapKeys { source: HeapId, index: usize },
    MapValues { source: HeapId, index: usize },
    MapEntries { source: HeapId, index: usize },
    Tuple { source: HeapId, index: usize },
    StringBytes { source: HeapId, index: usize },
    StringRunes { source: HeapId, index: usize },
    StringLines { source: HeapId, index: usize },
    Queue { source: HeapId },
    Range { next: i64, stop: i64, step: i64 },
    /// Wraps a user-defined iterator object: `$next` is called on `source`
    /// by the VM rather than advanced here.
    Generic { source: HeapId },
}

#[derive(Debug, Clone)]
pub struct PyroIter {
    pub kind: IterKind,
}

/// Line-number lookup table: run-length encoded `(instruction_count, line)`
/// pairs, matching spec.md §6's "bytecode_offset -> line_number run-length
/// table".
#[derive(Debug, Clone, Default)]
pub struct LineTable {
    runs: Vec<(u32, u32)>,
}

impl LineTable {
    pub fn push(&mut self, line: u32) {
        if let Some(last) = self.runs.last_mut()
            && last.1 == line
        {
            last.0 += 1;
            return;
        }
        self.runs.push((1, line));
    }

    #[must_use]
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        let mut remaining = offset;
        for &(count, line) in &self.runs {
            if remaining < count as usize {
                return line;
            }
            remaining -= count as usize;
        }
        self.runs.last().map_or(1, |r| r.1)
    }
}

/// A compiled function: bytecode + constants + metadata (spec.md §3.2).
#[derive(Debug, Clone)]
pub struct PyroFunction {
    pub name: HeapId,
    pub chunk: Chunk,
    pub source_id: SourceId,
    pub arity: u8,
    pub is_variadic: bool,
    /// Whether local slot 0 is a reserved receiver (`self`) rather than the
    /// first declared parameter — decides whether a call's callee slot
    /// becomes `frame.base` itself or is left dead one slot below it
    /// (spec.md §4.2's calling convention).
    pub is_method: bool,
    pub upvalue_count: u8,
    /// Default-argument expressions, compiled as zero-arg thunks
    /// (spec.md §4.3's "default values may be arbitrary expressions
    /// captured as zero-argument closures"). Index 0 corresponds to the
    /// first defaultable parameter.
    pub default_value_fns: Vec<HeapId>,
}

/// Where a `Closure` captures an upvalue from at `MakeClosure` time.
#[derive(Debug, Clone, Copy)]
pub struct UpvalueDescriptor {
    pub is_local: bool,
    pub index: u8,
}

#[derive(Debug, Clone)]
pub struct PyroClosure {
    pub function: HeapId,
    pub upvalues: SmallVec<[HeapId; 4]>,
    pub module: HeapId,
    /// `true` for the synthetic zero-arg thunks used for default-argument
    /// and field-default expressions (spec.md §9's "Default-argument
    /// expressions").
    pub is_default_value_expr: bool,
}

/// An upvalue cell: open (aliases a live stack slot) or closed (owns its
/// value), per spec.md §3.4.
#[derive(Debug, Clone)]
pub enum UpvalueState {
    Open { stack_index: usize },
    Closed { value: Value },
}

#[derive(Debug, Clone)]
pub struct PyroUpvalue {
    pub state: UpvalueState,
}

/// A native function body sees only a [`crate::vm::NativeContext`] — heap
/// access, not the interpreter loop itself — so one function pointer type
/// works regardless of which `ResourceTracker` the owning `Vm<T>` was built
/// with (spec.md §1's "register native functions/methods" external-
/// collaborator boundary; natives don't participate in resource accounting).
pub type NativeFnPtr = fn(&mut crate::vm::NativeContext, &[Value]) -> crate::error::RunResult<Value>;

#[derive(Clone)]
pub struct PyroNativeFn {
    pub name: HeapId,
    /// `-1` marks a variadic native (any argc accepted).
    pub arity: i32,
    pub func: NativeFnPtr,
    /// Whether this was registered as a method (`Vm::define_pub_method`/
    /// `define_priv_method`) rather than a free function
    /// (`Vm::define_native_fn`). A method call prepends the receiver to the
    /// slice `func` sees, matching `examples/original_source`'s `args[-1]`
    /// receiver convention (shifted by one since Rust slices don't index
    /// negatively).
    pub is_method: bool,
}

impl std::fmt::Debug for PyroNativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyroNativeFn").field("arity", &self.arity).finish_non_exhaustive()
    }
}

/// A field's default value: either a plain constant or a thunk closure to
/// evaluate per-instantiation (spec.md §3.4, §4.3).
#[derive(Debug, Clone, Copy)]
pub enum FieldDefault {
    Value(Value),
    ExprClosure(HeapId),
}

/// Copy-down class object (spec.md §4.2's "Copy-down inheritance"). On
/// `class C extends S`, `S`'s maps/vectors are cloned wholesale into `C` and
/// then overlaid with `C`'s own declarations — there is no runtime
/// method-resolution walk.
#[derive(Debug, Clone, Default)]
pub struct PyroClass {
    pub name: HeapId,
    pub all_instance_methods: ahash::AHashMap<HeapId, HeapId>,
    pub pub_instance_methods: ahash::AHashMap<HeapId, HeapId>,
    pub all_field_indexes: ahash::AHashMap<HeapId, u16>,
    pub pub_field_indexes: ahash::AHashMap<HeapId, u16>,
    pub default_field_values: Vec<FieldDefault>,
    pub static_methods: ahash::AHashMap<HeapId, HeapId>,
    pub static_fields: ahash::AHashMap<HeapId, Value>,
    pub init_method: Option<HeapId>,
    pub superclass: Option<HeapId>,
}

#[derive(Debug, Clone)]
pub struct PyroInstance {
    pub class: HeapId,
    pub fields: Box<[Value]>,
}

#[derive(Debug, Clone, Default)]
pub struct PyroModule {
    pub name: HeapId,
    pub members: Vec<Value>,
    pub all_member_indexes: ahash::AHashMap<HeapId, u16>,
    pub pub_member_indexes: ahash::AHashMap<HeapId, u16>,
}

#[derive(Debug, Clone)]
pub struct PyroError {
    pub message: HeapId,
    pub details: PyroMap,
}

#[derive(Debug, Clone, Copy)]
pub enum MethodRef {
    Closure(HeapId),
    Native(HeapId),
}

#[derive(Debug, Clone, Copy)]
pub struct PyroBoundMethod {
    pub receiver: Value,
    pub method: MethodRef,
}

#[derive(Debug, Clone, Default)]
pub struct PyroEnumType {
    pub name: HeapId,
    pub members: ahash::AHashMap<HeapId, HeapId>,
}

#[derive(Debug, Clone)]
pub struct PyroEnumMember {
    pub enum_type: HeapId,
    pub name: HeapId,
    pub payload: Value,
}
