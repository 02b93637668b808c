//! Binary/unary operator dispatch and value stringification (spec.md §4.5,
//! §4.6).
//!
//! Grounded on `examples/original_source/src/vm/vm.c`'s `BINARY_OP`-style
//! dispatch (numeric fast path, string concatenation, then a dunder-method
//! fallback) and on the teacher's own `Display`/`type_name` split in
//! `value.rs` for the stringify/debugify distinction (`echo` vs `??`).

use std::cmp::Ordering;

use crate::{
    bytecode::Opcode,
    error::{Panic, PanicKind},
    heap::HeapData,
    resource::ResourceTracker,
    value::Value,
};

use super::Vm;

impl<T: ResourceTracker> Vm<T> {
    pub(super) fn binary_op(&mut self, op: Opcode) -> Result<(), Panic> {
        let b = self.pop();
        let a = self.pop();
        let result = match op {
            Opcode::BinaryPlus => self.numeric_or_concat(a, b, |x, y| x + y, |x, y| x.wrapping_add(y))?,
            Opcode::BinaryMinus => self.arith(a, b, "-", |x, y| x - y, |x, y| x.wrapping_sub(y))?,
            Opcode::BinaryStar => self.arith(a, b, "*", |x, y| x * y, |x, y| x.wrapping_mul(y))?,
            Opcode::BinaryStarStar => self.power(a, b)?,
            Opcode::BinarySlash => self.true_div(a, b)?,
            Opcode::BinarySlashSlash => self.floor_div(a, b)?,
            Opcode::BinaryPercent | Opcode::BinaryMod => self.modulo(a, b, op == Opcode::BinaryMod)?,
            Opcode::BinaryAmp => self.int_op(a, b, "&", |x, y| x & y)?,
            Opcode::BinaryBar => self.int_op(a, b, "|", |x, y| x | y)?,
            Opcode::BinaryCaret => self.int_op(a, b, "^", |x, y| x ^ y)?,
            Opcode::BinaryLessLess => self.shift_op(a, b, true)?,
            Opcode::BinaryGreaterGreater => self.shift_op(a, b, false)?,
            Opcode::BinaryEqualEqual => Value::Bool(self.values_equal(a, b)),
            Opcode::BinaryBangEqual => Value::Bool(!self.values_equal(a, b)),
            Opcode::BinaryLess => self.compare(a, b, Ordering::is_lt)?,
            Opcode::BinaryLessEqual => self.compare(a, b, Ordering::is_le)?,
            Opcode::BinaryGreater => self.compare(a, b, Ordering::is_gt)?,
            Opcode::BinaryGreaterEqual => self.compare(a, b, Ordering::is_ge)?,
            Opcode::BinaryIn => Value::Bool(self.contains(a, b)?),
            _ => unreachable!("binary_op called with non-binary opcode {op:?}"),
        };
        self.push(result);
        Ok(())
    }

    pub(super) fn unary_op(&mut self, op: Opcode) -> Result<(), Panic> {
        let a = self.pop();
        let result = match (op, a) {
            (Opcode::UnaryMinus, Value::I64(i)) => Value::I64(-i),
            (Opcode::UnaryMinus, Value::F64(f)) => Value::F64(-f),
            (Opcode::UnaryMinus, _) => return Err(self.panic_here(PanicKind::TypeError, format!("cannot negate a {}", a.type_name(&self.heap)))),
            (Opcode::UnaryPlus, Value::I64(_) | Value::F64(_)) => a,
            (Opcode::UnaryPlus, _) => return Err(self.panic_here(PanicKind::TypeError, format!("cannot apply unary '+' to a {}", a.type_name(&self.heap)))),
            (Opcode::UnaryBang, _) => Value::Bool(!a.is_truthy()),
            (Opcode::UnaryTilde, Value::I64(i)) => Value::I64(!i),
            (Opcode::UnaryTilde, _) => return Err(self.panic_here(PanicKind::TypeError, format!("cannot apply '~' to a {}", a.type_name(&self.heap)))),
            _ => unreachable!("unary_op called with non-unary opcode {op:?}"),
        };
        self.push(result);
        Ok(())
    }

    fn numeric_or_concat(&mut self, a: Value, b: Value, f_op: fn(f64, f64) -> f64, i_op: fn(i64, i64) -> i64) -> Result<Value, Panic> {
        if let (Value::Obj(x), Value::Obj(y)) = (a, b)
            && matches!(self.heap.get(x), HeapData::Str(_))
            && matches!(self.heap.get(y), HeapData::Str(_))
        {
            let mut s = self.heap.str_bytes(x).to_string();
            s.push_str(self.heap.str_bytes(y));
            return Ok(Value::Obj(self.heap.intern_str(&s)));
        }
        self.arith(a, b, "+", f_op, i_op)
    }

    fn arith(&mut self, a: Value, b: Value, symbol: &str, f_op: fn(f64, f64) -> f64, i_op: fn(i64, i64) -> i64) -> Result<Value, Panic> {
        match (a, b) {
            (Value::I64(x), Value::I64(y)) => Ok(Value::I64(i_op(x, y))),
            (Value::F64(x), Value::F64(y)) => Ok(Value::F64(f_op(x, y))),
            (Value::I64(x), Value::F64(y)) => Ok(Value::F64(f_op(x as f64, y))),
            (Value::F64(x), Value::I64(y)) => Ok(Value::F64(f_op(x, y as f64))),
            _ => Err(self.panic_here(
                PanicKind::TypeError,
                format!("unsupported operand types for '{symbol}': {} and {}", a.type_name(&self.heap), b.type_name(&self.heap)),
            )),
        }
    }

    fn power(&mut self, a: Value, b: Value) -> Result<Value, Panic> {
        match (a, b) {
            (Value::I64(x), Value::I64(y)) if y >= 0 => Ok(Value::I64(x.wrapping_pow(y as u32))),
            (Value::I64(x), Value::I64(y)) => Ok(Value::F64((x as f64).powf(y as f64))),
            (Value::F64(x), Value::I64(y)) => Ok(Value::F64(x.powi(y as i32))),
            (Value::I64(x), Value::F64(y)) => Ok(Value::F64((x as f64).powf(y))),
            (Value::F64(x), Value::F64(y)) => Ok(Value::F64(x.powf(y))),
            _ => Err(self.panic_here(PanicKind::TypeError, "unsupported operand types for '**'")),
        }
    }

    fn true_div(&mut self, a: Value, b: Value) -> Result<Value, Panic> {
        let (x, y) = self.as_f64_pair(a, b)?;
        if y == 0.0 {
            return Err(self.panic_here(PanicKind::ValueError, "division by zero"));
        }
        Ok(Value::F64(x / y))
    }

    /// `//` truncates toward zero (Rust's native integer `/`), unlike `mod`'s
    /// floored convention below — spec.md §4.6 draws this contrast explicitly.
    fn floor_div(&mut self, a: Value, b: Value) -> Result<Value, Panic> {
        match (a, b) {
            (Value::I64(x), Value::I64(y)) => {
                if y == 0 {
                    return Err(self.panic_here(PanicKind::ValueError, "division by zero"));
                }
                Ok(Value::I64(x / y))
            }
            _ => {
                let (x, y) = self.as_f64_pair(a, b)?;
                if y == 0.0 {
                    return Err(self.panic_here(PanicKind::ValueError, "division by zero"));
                }
                Ok(Value::F64((x / y).trunc()))
            }
        }
    }

    /// `%` is truncating remainder (Rust's native `%`, sign follows the
    /// dividend); `mod` is floored, sign follows the divisor (spec.md §9's
    /// mod-sign convention, confirmed against `original_source/`'s modulo
    /// opcode handling — see DESIGN.md).
    fn modulo(&mut self, a: Value, b: Value, is_mod_keyword: bool) -> Result<Value, Panic> {
        match (a, b) {
            (Value::I64(x), Value::I64(y)) => {
                if y == 0 {
                    return Err(self.panic_here(PanicKind::ValueError, "modulo by zero"));
                }
                let r = x % y;
                Ok(Value::I64(if is_mod_keyword && r != 0 && (r < 0) != (y < 0) { r + y } else { r }))
            }
            _ => {
                let (x, y) = self.as_f64_pair(a, b)?;
                if y == 0.0 {
                    return Err(self.panic_here(PanicKind::ValueError, "modulo by zero"));
                }
                let r = x % y;
                Ok(Value::F64(if is_mod_keyword && r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r }))
            }
        }
    }

    fn int_op(&mut self, a: Value, b: Value, symbol: &str, op: fn(i64, i64) -> i64) -> Result<Value, Panic> {
        match (a, b) {
            (Value::I64(x), Value::I64(y)) => Ok(Value::I64(op(x, y))),
            _ => Err(self.panic_here(PanicKind::TypeError, format!("'{symbol}' requires two i64 operands"))),
        }
    }

    fn shift_op(&mut self, a: Value, b: Value, left: bool) -> Result<Value, Panic> {
        match (a, b) {
            (Value::I64(x), Value::I64(y)) if (0..64).contains(&y) => {
                Ok(Value::I64(if left { x.wrapping_shl(y as u32) } else { x.wrapping_shr(y as u32) }))
            }
            (Value::I64(_), Value::I64(_)) => Err(self.panic_here(PanicKind::ValueError, "shift amount out of range")),
            _ => Err(self.panic_here(PanicKind::TypeError, "shift operators require two i64 operands")),
        }
    }

    fn as_f64_pair(&mut self, a: Value, b: Value) -> Result<(f64, f64), Panic> {
        let x = match a {
            Value::I64(i) => i as f64,
            Value::F64(f) => f,
            _ => return Err(self.panic_here(PanicKind::TypeError, "expected a number")),
        };
        let y = match b {
            Value::I64(i) => i as f64,
            Value::F64(f) => f,
            _ => return Err(self.panic_here(PanicKind::TypeError, "expected a number")),
        };
        Ok((x, y))
    }

    fn compare(&mut self, a: Value, b: Value, test: fn(Ordering) -> bool) -> Result<Value, Panic> {
        match a.partial_cmp_numeric(&b) {
            Some(ord) => Ok(Value::Bool(test(ord))),
            None => {
                if let (Value::Obj(x), Value::Obj(y)) = (a, b)
                    && let (HeapData::Str(sx), HeapData::Str(sy)) = (self.heap.get(x), self.heap.get(y))
                {
                    return Ok(Value::Bool(test(sx.bytes.cmp(&sy.bytes))));
                }
                Err(self.panic_here(
                    PanicKind::TypeError,
                    format!("cannot compare {} and {}", a.type_name(&self.heap), b.type_name(&self.heap)),
                ))
            }
        }
    }

    /// `in` membership: vectors/tuples/strings search by value, maps/sets
    /// search keys (spec.md §4.5).
    fn contains(&mut self, needle: Value, haystack: Value) -> Result<bool, Panic> {
        let Value::Obj(id) = haystack else {
            return Err(self.panic_here(PanicKind::TypeError, "right side of 'in' must be a container"));
        };
        match self.heap.get(id) {
            HeapData::Vector(v) => Ok(v.values.iter().any(|v| v.raw_eq(&needle))),
            HeapData::Tuple(t) => Ok(t.values.iter().any(|v| v.raw_eq(&needle))),
            HeapData::Map(m) => {
                let hash = needle.raw_hash(&self.heap);
                Ok(m.contains(hash, needle, |x, y| x.raw_eq(&y)))
            }
            HeapData::Str(haystack_str) => {
                let Value::Obj(needle_id) = needle else {
                    return Err(self.panic_here(PanicKind::TypeError, "'in' on a string requires a string operand"));
                };
                let needle_str = self.heap.str_bytes(needle_id);
                Ok(haystack_str.bytes.contains(needle_str))
            }
            _ => Err(self.panic_here(PanicKind::TypeError, "value is not a container")),
        }
    }

    /// Default (dunder-free) value equality, per `Value::raw_eq` augmented
    /// with heap-aware string-content comparison (strings are interned, so
    /// `raw_eq`'s identity check already covers it, but this stays the one
    /// path `==` goes through in case interning is ever relaxed).
    pub(super) fn values_equal(&self, a: Value, b: Value) -> bool {
        a.raw_eq(&b)
    }

    /// `echo`/string-interpolation rendering: strings render unquoted,
    /// everything else via its debug form (spec.md §4.6 distinguishes
    /// `stringify` from `debugify`, but both fall back to the same printed
    /// form for scalars).
    pub(crate) fn stringify(&self, value: Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::I64(i) => i.to_string(),
            Value::F64(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Value::Rune(c) => c.to_string(),
            Value::Obj(id) => match self.heap.get(id) {
                HeapData::Str(s) => s.bytes.to_string(),
                _ => self.debugify(value),
            },
        }
    }

    /// `??`/debug rendering: strings are quoted, containers render their
    /// elements recursively.
    pub(crate) fn debugify(&self, value: Value) -> String {
        match value {
            Value::Obj(id) => match self.heap.get(id) {
                HeapData::Str(s) => format!("\"{}\"", s.bytes),
                HeapData::Vector(v) => {
                    let parts: Vec<String> = v.values.iter().map(|v| self.debugify(*v)).collect();
                    format!("[{}]", parts.join(", "))
                }
                HeapData::Tuple(t) => {
                    let parts: Vec<String> = t.values.iter().map(|v| self.debugify(*v)).collect();
                    format!("({})", parts.join(", "))
                }
                HeapData::Map(m) => {
                    let parts: Vec<String> = m.iter().map(|(k, v)| format!("{}: {}", self.debugify(k), self.debugify(v))).collect();
                    format!("{{{}}}", parts.join(", "))
                }
                HeapData::Instance(inst) => {
                    let HeapData::Class(class) = self.heap.get(inst.class) else { unreachable!() };
                    format!("<instance of {}>", self.heap.str_bytes(class.name))
                }
                HeapData::Error(e) => format!("<err: {}>", self.heap.str_bytes(e.message)),
                _ => format!("<{}>", self.heap.type_name(id)),
            },
            other => self.stringify(other),
        }
    }

    /// The format-specifier half of `"${expr;spec}"` interpolation (spec.md
    /// §4.1): `spec` is whatever text sat between the `;` and the closing
    /// `}`. Empty defers to `stringify`; `?`/`??` to `debugify`/the type
    /// name; a leading `d`/`x`/`X`/`o` picks an integer base; `f`/`e`, with an
    /// optional leading digit run as a precision, format a float. Anything
    /// else falls back to `stringify` rather than panicking — spec.md leaves
    /// the full specifier grammar open, so only the common cases are wired up
    /// (noted in DESIGN.md).
    pub(super) fn format_value(&self, value: Value, spec: &str) -> Result<String, Panic> {
        if spec.is_empty() {
            return Ok(self.stringify(value));
        }
        if spec == "?" {
            return Ok(self.debugify(value));
        }
        if spec == "??" {
            return Ok(value.type_name(&self.heap).to_string());
        }
        match spec {
            "d" => match value {
                Value::I64(i) => return Ok(i.to_string()),
                _ => return Err(self.panic_here(PanicKind::TypeError, "format spec 'd' requires an i64")),
            },
            "x" => match value {
                Value::I64(i) => return Ok(format!("{i:x}")),
                _ => return Err(self.panic_here(PanicKind::TypeError, "format spec 'x' requires an i64")),
            },
            "X" => match value {
                Value::I64(i) => return Ok(format!("{i:X}")),
                _ => return Err(self.panic_here(PanicKind::TypeError, "format spec 'X' requires an i64")),
            },
            "o" => match value {
                Value::I64(i) => return Ok(format!("{i:o}")),
                _ => return Err(self.panic_here(PanicKind::TypeError, "format spec 'o' requires an i64")),
            },
            _ => {}
        }
        let (precision, kind) = spec.split_at(spec.len() - 1);
        if (kind == "f" || kind == "e") && (precision.is_empty() || precision.chars().all(|c| c.is_ascii_digit())) {
            let f = match value {
                Value::F64(f) => f,
                Value::I64(i) => i as f64,
                _ => return Err(self.panic_here(PanicKind::TypeError, format!("format spec '{spec}' requires a number"))),
            };
            let prec: usize = if precision.is_empty() { 6 } else { precision.parse().unwrap() };
            return Ok(if kind == "f" { format!("{f:.prec$}") } else { format!("{f:.prec$e}") });
        }
        Ok(self.stringify(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{objects::PyroVector, resource::NoLimitTracker};

    #[test]
    fn stringify_matches_the_text_echo_would_print() {
        let vm = Vm::<NoLimitTracker>::new();
        assert_eq!(vm.stringify(Value::I64(3)), "3");
        assert_eq!(vm.stringify(Value::I64(55)), "55");
        assert_eq!(vm.stringify(Value::Bool(true)), "true");
    }

    #[test]
    fn debugify_renders_a_vector_the_way_echo_prints_it() {
        let mut vm = Vm::<NoLimitTracker>::new();
        let id = vm.heap.alloc(HeapData::Vector(PyroVector { values: vec![Value::I64(1), Value::I64(2), Value::I64(3)], version: 0 }));
        assert_eq!(vm.stringify(Value::Obj(id)), "[1, 2, 3]");
    }
}
