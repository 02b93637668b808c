//! The minimal native surface the core registers on itself — not a stdlib
//! (spec.md §1 names `math`/`fs`/`log`/`csrng`/`prng` as out-of-scope
//! external collaborators), but the handful of names the language's own
//! semantics assume exist: `$is_err` (the counterpart to `try`'s caught-panic
//! `Error` values), `$file` (opening a file handle), and `vec:sort`.
//!
//! Grounded on `examples/original_source/src/builtins/file.c` (`fn_file`'s
//! exact panic message) and `src/builtins/vec.c` (`vec_sort`, and the
//! `args[-1]`-is-the-receiver convention native methods use — mirrored here
//! as `args[0]` since Rust slices don't index negatively, see
//! [`crate::objects::PyroNativeFn::is_method`]).
//!
//! A native function here only ever sees a [`NativeContext`] (heap access),
//! never the interpreter loop — it can't invoke a Pyro closure. That rules
//! out `vec:sort`'s optional custom-comparator argument; calling `sort()`
//! with one panics rather than silently ignoring it.

use std::cmp::Ordering;

use crate::{
    error::{Panic, PanicKind, RunResult},
    heap::HeapData,
    objects::{PyroFile, PyroNativeFn},
    resource::ResourceTracker,
    value::Value,
    vm::{NativeContext, Vm},
};

/// Registers every name this module provides onto a freshly constructed
/// `Vm`: `$is_err`/`$file` as superglobals, `sort` as a public instance
/// method on the built-in `vec` class. Called once from
/// `Vm::with_tracker` so every construction path (direct use, and
/// `embed::Vm`, which wraps it) gets the same baseline.
pub(crate) fn install<T: ResourceTracker>(vm: &mut Vm<T>) {
    register_superglobal_fn(vm, "$is_err", 1, is_err);
    register_superglobal_fn(vm, "$file", -1, file_open);
    register_vec_method(vm, "sort", -1, vec_sort);
}

fn register_superglobal_fn<T: ResourceTracker>(vm: &mut Vm<T>, name: &str, arity: i32, func: crate::objects::NativeFnPtr) {
    let name_id = vm.heap.intern_str(name);
    let native = PyroNativeFn { name: name_id, arity, func, is_method: false };
    let native_id = vm.heap.alloc(HeapData::NativeFn(native));
    vm.define_global(name, Value::Obj(native_id));
}

fn register_vec_method<T: ResourceTracker>(vm: &mut Vm<T>, name: &str, arity: i32, func: crate::objects::NativeFnPtr) {
    let name_id = vm.heap.intern_str(name);
    let native = PyroNativeFn { name: name_id, arity, func, is_method: true };
    let native_id = vm.heap.alloc(HeapData::NativeFn(native));
    let vec_class_id = vm.heap.classes.vec_class;
    let HeapData::Class(class) = vm.heap.get_mut(vec_class_id) else { unreachable!("classes.vec_class is always a Class") };
    class.all_instance_methods.insert(name_id, native_id);
    class.pub_instance_methods.insert(name_id, native_id);
}

/// `$is_err(v)`: `true` for a value produced by a caught `try` panic, `false`
/// for anything else (spec.md's end-to-end scenario 5).
fn is_err(ctx: &mut NativeContext, args: &[Value]) -> RunResult<Value> {
    let is_error = matches!(args[0], Value::Obj(id) if matches!(ctx.heap().get(id), HeapData::Error(_)));
    Ok(Value::Bool(is_error))
}

/// `$file(path)` or `$file(path, mode)`: opens a file handle. `mode` is one
/// of `"r"` (default), `"w"`, or `"a"`; anything else panics. Panics with
/// exactly `$file(): unable to open file '<path>'` on failure, matching
/// `examples/original_source`'s `fn_file` message (spec.md's end-to-end
/// scenario 6).
fn file_open(ctx: &mut NativeContext, args: &[Value]) -> RunResult<Value> {
    if args.is_empty() || args.len() > 2 {
        return Err(Panic::arity("1 or 2", args.len()));
    }
    let Value::Obj(path_id) = args[0] else {
        return Err(Panic::type_error("$file(): expected a string path"));
    };
    let path = match ctx.heap().get(path_id) {
        HeapData::Str(s) => s.bytes.to_string(),
        _ => return Err(Panic::type_error("$file(): expected a string path")),
    };
    let mode = match args.get(1) {
        None => "r".to_string(),
        Some(Value::Obj(id)) => match ctx.heap().get(*id) {
            HeapData::Str(s) => s.bytes.to_string(),
            _ => return Err(Panic::type_error("$file(): expected a string mode")),
        },
        Some(_) => return Err(Panic::type_error("$file(): expected a string mode")),
    };

    let mut options = std::fs::OpenOptions::new();
    match mode.as_str() {
        "r" => {
            options.read(true);
        }
        "w" => {
            options.write(true).create(true).truncate(true);
        }
        "a" => {
            options.append(true).create(true);
        }
        other => return Err(Panic::value_error(format!("$file(): invalid mode '{other}'"))),
    }
    let Ok(handle) = options.open(&path) else {
        return Err(Panic::new(PanicKind::IoError, format!("$file(): unable to open file '{path}'")));
    };

    let file = PyroFile { handle: Some(handle), path: Some(path.into_boxed_str()) };
    Ok(Value::Obj(ctx.heap_mut().alloc(HeapData::File(file))))
}

/// `v:sort()`: ascending in place by the default ordering (numeric values
/// compared numerically, strings compared byte-wise; a mix of incomparable
/// kinds panics). `v:sort(callback)` panics — see module docs.
fn vec_sort(ctx: &mut NativeContext, args: &[Value]) -> RunResult<Value> {
    let receiver = args[0];
    if args.len() > 1 {
        return Err(Panic::type_error("sort(): a custom comparator is not supported in this build"));
    }
    let Value::Obj(id) = receiver else { unreachable!("sort() is always bound to an object receiver") };

    let mut values = match ctx.heap_mut().get_mut(id) {
        HeapData::Vector(vec) => std::mem::take(&mut vec.values),
        _ => unreachable!("sort() is always bound to a vec receiver"),
    };

    let mut incomparable = false;
    values.sort_by(|a, b| match default_cmp(ctx.heap(), *a, *b) {
        Some(ord) => ord,
        None => {
            incomparable = true;
            Ordering::Equal
        }
    });

    match ctx.heap_mut().get_mut(id) {
        HeapData::Vector(vec) => {
            vec.values = values;
            vec.bump_version();
        }
        _ => unreachable!("sort() is always bound to a vec receiver"),
    }

    if incomparable {
        return Err(Panic::new(PanicKind::ValueError, "sort(): elements are not comparable"));
    }
    Ok(receiver)
}

fn default_cmp(heap: &crate::heap::Heap, a: Value, b: Value) -> Option<Ordering> {
    if let Some(ord) = a.partial_cmp_numeric(&b) {
        return Some(ord);
    }
    if let (Value::Obj(x), Value::Obj(y)) = (a, b)
        && let (HeapData::Str(sx), HeapData::Str(sy)) = (heap.get(x), heap.get(y))
    {
        return Some(sx.bytes.cmp(&sy.bytes));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{objects::PyroVector, resource::NoLimitTracker};

    fn new_vm() -> Vm<NoLimitTracker> {
        Vm::new()
    }

    fn as_i64(v: Value) -> i64 {
        match v {
            Value::I64(i) => i,
            other => panic!("expected an I64, got {other:?}"),
        }
    }

    #[test]
    fn is_err_reports_error_values() {
        let mut vm = new_vm();
        let panic = Panic::type_error("boom");
        let err_value = vm.make_error_value(&panic);
        let mut ctx = NativeContext::new(&mut vm.heap);
        assert!(matches!(is_err(&mut ctx, &[err_value]).unwrap(), Value::Bool(true)));
        assert!(matches!(is_err(&mut ctx, &[Value::I64(3)]).unwrap(), Value::Bool(false)));
    }

    #[test]
    fn file_open_panics_with_exact_message_for_missing_file() {
        let mut vm = new_vm();
        let path = vm.heap.intern_str("no-such");
        let mut ctx = NativeContext::new(&mut vm.heap);
        let err = file_open(&mut ctx, &[Value::Obj(path)]).unwrap_err();
        assert_eq!(err.message, "$file(): unable to open file 'no-such'");
    }

    #[test]
    fn vec_sort_orders_integers_ascending() {
        let mut vm = new_vm();
        let id = vm.heap.alloc(HeapData::Vector(PyroVector { values: vec![Value::I64(3), Value::I64(1), Value::I64(2)], version: 0 }));
        let mut ctx = NativeContext::new(&mut vm.heap);
        vec_sort(&mut ctx, &[Value::Obj(id)]).unwrap();
        let HeapData::Vector(vec) = ctx.heap().get(id) else { unreachable!() };
        let sorted: Vec<i64> = vec.values.iter().map(|v| as_i64(*v)).collect();
        assert_eq!(sorted, vec![1, 2, 3]);
    }

    #[test]
    fn vec_sort_rejects_a_comparator_argument() {
        let mut vm = new_vm();
        let id = vm.heap.alloc(HeapData::Vector(PyroVector { values: vec![], version: 0 }));
        let mut ctx = NativeContext::new(&mut vm.heap);
        let err = vec_sort(&mut ctx, &[Value::Obj(id), Value::Null]).unwrap_err();
        assert_eq!(err.kind, PanicKind::TypeError);
    }
}
