//! The `for`-loop iteration protocol (spec.md §4.2).
//!
//! `GetIterator` wraps a container in a `PyroIter` (snapshotting a vector's
//! `version` so later mutation can be detected); `GetNextFromIterator`
//! advances it, producing either the next value or a sentinel `Error` object
//! that the compiler's `JumpIfErr` treats as "stop" (see
//! `compiler/mod.rs::for_statement`). Grounded on
//! `examples/original_source/src/vm/vm.c`'s `$next` dispatch, generalized
//! from the teacher's Python-iterator-protocol-over-generators (dropped —
//! Pyro's iterators are plain heap objects, not suspended call frames).

use crate::{
    error::{Panic, PanicKind},
    heap::{HeapData, HeapId},
    objects::{IterKind, PyroIter},
    resource::ResourceTracker,
    value::Value,
};

use super::Vm;

impl<T: ResourceTracker> Vm<T> {
    /// Pops a container value, pushes a fresh `PyroIter` over it.
    pub(super) fn op_get_iterator(&mut self) -> Result<(), Panic> {
        let container = self.pop();
        let kind = self.make_iter_kind(container)?;
        let id = self.heap.alloc(HeapData::Iter(PyroIter { kind }));
        self.push(Value::Obj(id));
        Ok(())
    }

    fn make_iter_kind(&mut self, container: Value) -> Result<IterKind, Panic> {
        let Value::Obj(id) = container else {
            return Err(self.panic_here(PanicKind::TypeError, format!("{} is not iterable", container.type_name(&self.heap))));
        };
        Ok(match self.heap.get(id) {
            HeapData::Vector(v) => IterKind::Vector { source: id, index: 0, version_seen: v.version },
            HeapData::Tuple(_) => IterKind::Tuple { source: id, index: 0 },
            HeapData::Map(m) if m.is_set => IterKind::MapKeys { source: id, index: 0 },
            HeapData::Map(_) => IterKind::MapEntries { source: id, index: 0 },
            HeapData::Queue(_) => IterKind::Queue { source: id },
            HeapData::Str(_) => IterKind::StringRunes { source: id, index: 0 },
            HeapData::Iter(it) => it.kind.clone(),
            HeapData::Instance(_) => IterKind::Generic { source: id },
            _ => return Err(self.panic_here(PanicKind::TypeError, format!("{} is not iterable", self.heap.type_name(id)))),
        })
    }

    /// Pops the iterator, pushes the next value or an `Error` sentinel once
    /// exhausted.
    pub(super) fn op_get_next_from_iterator(&mut self) -> Result<(), Panic> {
        let top = self.pop();
        let Value::Obj(iter_id) = top else {
            return Err(self.panic_here(PanicKind::TypeError, "expected an iterator"));
        };
        let HeapData::Iter(_) = self.heap.get(iter_id) else {
            return Err(self.panic_here(PanicKind::TypeError, "expected an iterator"));
        };
        let next = self.advance_iter(iter_id)?;
        let value = match next {
            Some(v) => v,
            None => {
                let message = self.heap.intern_str("iterator exhausted");
                let error = crate::objects::PyroError { message, details: crate::objects::PyroMap::new(false) };
                Value::Obj(self.heap.alloc(HeapData::Error(error)))
            }
        };
        self.push(value);
        Ok(())
    }

    fn advance_iter(&mut self, iter_id: HeapId) -> Result<Option<Value>, Panic> {
        let HeapData::Iter(iter) = self.heap.get(iter_id) else { unreachable!() };
        let kind = iter.kind.clone();
        match kind {
            IterKind::Vector { source, index, version_seen } => {
                let HeapData::Vector(v) = self.heap.get(source) else { unreachable!("iterator source is always a Vector") };
                if v.version != version_seen || index >= v.values.len() {
                    return Ok(None);
                }
                let value = v.values[index];
                self.set_iter_kind(iter_id, IterKind::Vector { source, index: index + 1, version_seen });
                Ok(Some(value))
            }
            IterKind::Tuple { source, index } => {
                let HeapData::Tuple(t) = self.heap.get(source) else { unreachable!() };
                if index >= t.values.len() {
                    return Ok(None);
                }
                let value = t.values[index];
                self.set_iter_kind(iter_id, IterKind::Tuple { source, index: index + 1 });
                Ok(Some(value))
            }
            IterKind::MapKeys { source, index } => {
                let HeapData::Map(m) = self.heap.get(source) else { unreachable!() };
                let entries: Vec<Value> = m.iter().map(|(k, _)| k).collect();
                if index >= entries.len() {
                    return Ok(None);
                }
                self.set_iter_kind(iter_id, IterKind::MapKeys { source, index: index + 1 });
                Ok(Some(entries[index]))
            }
            IterKind::MapValues { source, index } => {
                let HeapData::Map(m) = self.heap.get(source) else { unreachable!() };
                let entries: Vec<Value> = m.iter().map(|(_, v)| v).collect();
                if index >= entries.len() {
                    return Ok(None);
                }
                self.set_iter_kind(iter_id, IterKind::MapValues { source, index: index + 1 });
                Ok(Some(entries[index]))
            }
            IterKind::MapEntries { source, index } => {
                let HeapData::Map(m) = self.heap.get(source) else { unreachable!() };
                let entries: Vec<(Value, Value)> = m.iter().collect();
                if index >= entries.len() {
                    return Ok(None);
                }
                let (k, v) = entries[index];
                let tup = crate::objects::PyroTuple { values: vec![k, v].into_boxed_slice() };
                let tup_id = self.heap.alloc(HeapData::Tuple(tup));
                self.set_iter_kind(iter_id, IterKind::MapEntries { source, index: index + 1 });
                Ok(Some(Value::Obj(tup_id)))
            }
            IterKind::Queue { source } => {
                let HeapData::Queue(q) = self.heap.get_mut(source) else { unreachable!() };
                Ok(q.items.pop_front())
            }
            IterKind::StringBytes { source, index } => {
                let HeapData::Str(s) = self.heap.get(source) else { unreachable!() };
                if index >= s.bytes.len() {
                    return Ok(None);
                }
                let byte = s.bytes.as_bytes()[index];
                self.set_iter_kind(iter_id, IterKind::StringBytes { source, index: index + 1 });
                Ok(Some(Value::I64(i64::from(byte))))
            }
            IterKind::StringRunes { source, index } => {
                let HeapData::Str(s) = self.heap.get(source) else { unreachable!() };
                let Some((rune, rest_index)) = s.bytes[index..].chars().next().map(|c| (c, index + c.len_utf8())) else {
                    return Ok(None);
                };
                self.set_iter_kind(iter_id, IterKind::StringRunes { source, index: rest_index });
                Ok(Some(Value::Rune(rune)))
            }
            IterKind::StringLines { source, index } => {
                let HeapData::Str(s) = self.heap.get(source) else { unreachable!() };
                if index >= s.bytes.len() {
                    return Ok(None);
                }
                let rest = &s.bytes[index..];
                let (line, consumed) = match rest.find('\n') {
                    Some(pos) => (rest[..pos].trim_end_matches('\r').to_string(), pos + 1),
                    None => (rest.to_string(), rest.len()),
                };
                let line_id = self.heap.intern_str(&line);
                self.set_iter_kind(iter_id, IterKind::StringLines { source, index: index + consumed });
                Ok(Some(Value::Obj(line_id)))
            }
            IterKind::Range { next, stop, step } => {
                if (step > 0 && next >= stop) || (step < 0 && next <= stop) || step == 0 {
                    return Ok(None);
                }
                self.set_iter_kind(iter_id, IterKind::Range { next: next + step, stop, step });
                Ok(Some(Value::I64(next)))
            }
            IterKind::Generic { source } => self.call_next_method(source),
        }
    }

    fn set_iter_kind(&mut self, iter_id: HeapId, kind: IterKind) {
        if let HeapData::Iter(iter) = self.heap.get_mut(iter_id) {
            iter.kind = kind;
        }
    }

    /// Calls a user-defined iterator's `$next` method, treating a `null`
    /// result as "exhausted" (spec.md §4.2's generic iterator protocol).
    fn call_next_method(&mut self, source: HeapId) -> Result<Option<Value>, Panic> {
        let HeapData::Instance(inst) = self.heap.get(source) else {
            return Err(self.panic_here(PanicKind::TypeError, "expected an iterable instance"));
        };
        let class_id = inst.class;
        let next_name = self.heap.intern_str("$next");
        let HeapData::Class(class) = self.heap.get(class_id) else { unreachable!() };
        let Some(&method) = class.all_instance_methods.get(&next_name) else {
            return Err(self.panic_here(PanicKind::TypeError, "instance has no '$next' method"));
        };
        self.push(Value::Obj(source));
        let depth = self.frames.len();
        self.call_closure(method, 0)?;
        let result = self.run_until(depth)?;
        Ok(if result.is_null() { None } else { Some(result) })
    }
}
