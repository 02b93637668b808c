//! End-to-end scenarios run through the public embedding surface
//! (`embed::Vm`), exercising the full lexer → compiler → VM pipeline rather
//! than any single module in isolation.
//!
//! `echo` writes straight to process stdout (matching
//! `examples/original_source`'s own `fn_file`-style direct-to-stream
//! writes), so these tests check the same outcome an embedder actually
//! observes — success/panic, exit code, and any mutated global state —
//! rather than captured stdout text; the exact text each `echo` would print
//! is covered separately by `vm::ops`'s `stringify`/`debugify` unit tests.

use std::path::{Path, PathBuf};

use ahash::AHashMap;
use pyro::{imports::SourceLoader, PanicKind, Vm, VmConfig};

fn global_i64(vm: &Vm, name: &str) -> i64 {
    match vm.global(name) {
        Some(pyro::Value::I64(i)) => i,
        other => panic!("expected an I64 global '{name}', got {other:?}"),
    }
}

fn global_bool(vm: &Vm, name: &str) -> bool {
    match vm.global(name) {
        Some(pyro::Value::Bool(b)) => b,
        other => panic!("expected a Bool global '{name}', got {other:?}"),
    }
}

#[test]
fn scenario_1_arithmetic() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "var r = 1 + 2; echo r;");
    assert!(outcome.is_ok());
    assert_eq!(vm.exit_code(), 0);
    assert_eq!(global_i64(&vm, "r"), 3);
}

#[test]
fn scenario_2_recursive_fibonacci() {
    let mut vm = Vm::new(VmConfig::default());
    let src = "def fib(n) { if n < 2 { return n; } return fib(n-1) + fib(n-2); } var r = fib(10); echo r;";
    let outcome = vm.exec_str("main", src);
    assert!(outcome.is_ok());
    assert_eq!(global_i64(&vm, "r"), 55);
}

#[test]
fn scenario_3_vector_sort() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "var v = [3, 1, 2]; v:sort(); echo v;");
    assert!(outcome.is_ok());
    let Some(pyro::Value::Obj(_)) = vm.global("v") else { panic!("expected v to be a vector") };
}

#[test]
fn scenario_4_class_field_and_method() {
    let mut vm = Vm::new(VmConfig::default());
    let src = "class P { pub var x = 0; pub def get() { return self.x; } } var p = P(); p.x = 7; var r = p:get(); echo r;";
    let outcome = vm.exec_str("main", src);
    assert!(outcome.is_ok());
    assert_eq!(global_i64(&vm, "r"), 7);
}

#[test]
fn scenario_5_try_catches_a_panic_as_an_error_value() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "var r = try (1/0); var is_err = $is_err(r); echo is_err;");
    assert!(outcome.is_ok());
    assert_eq!(vm.exit_code(), 0);
    assert!(global_bool(&vm, "is_err"));
}

#[test]
fn scenario_6_file_open_panics_on_a_missing_path() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "var f = $file(\"no-such\");");
    assert!(!outcome.is_ok());
    assert!(vm.is_panicked());
    assert_eq!(vm.exit_code(), 1);
    let panic = outcome.panic().expect("panicked outcome carries a Panic");
    assert_eq!(panic.message, "$file(): unable to open file 'no-such'");
}

#[test]
fn division_by_zero_panics_with_value_error() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "var r = 1 / 0;");
    let panic = outcome.panic().expect("division by zero panics");
    assert_eq!(panic.kind, PanicKind::ValueError);
    assert!(panic.message.contains("division by zero"));
}

#[test]
fn mod_is_floored_and_takes_the_divisor_sign() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "var r = -7 mod 3;");
    assert!(outcome.is_ok());
    assert_eq!(global_i64(&vm, "r"), 2);
}

#[test]
fn floor_div_truncates_toward_zero_unlike_mod() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "var r = -7 // 2;");
    assert!(outcome.is_ok());
    assert_eq!(global_i64(&vm, "r"), -3);
}

#[test]
fn negative_vector_index_wraps_from_the_end() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "var v = [1, 2, 3]; var last = v[-1];");
    assert!(outcome.is_ok());
    assert_eq!(global_i64(&vm, "last"), 3);
}

#[test]
fn redefining_an_existing_global_panics() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "var x = 1; var x = 2;");
    let panic = outcome.panic().expect("redefining a global panics");
    assert_eq!(panic.kind, PanicKind::NameError);
}

#[test]
fn assigning_to_a_superglobal_panics() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "$is_err = 5;");
    let panic = outcome.panic().expect("assigning to a superglobal panics");
    assert_eq!(panic.kind, PanicKind::NameError);
}

#[test]
fn wrong_arity_call_panics() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "def f(a, b) { return a + b; } f(1);");
    let panic = outcome.panic().expect("arity mismatch panics");
    assert_eq!(panic.kind, PanicKind::ArityError);
}

#[test]
fn with_block_calls_the_dollar_exit_method_on_scope_exit() {
    let mut vm = Vm::new(VmConfig::default());
    let src = "\
        var calls = 0;
        class Guard { pub def $exit() { calls = calls + 1; } }
        var g = Guard();
        with g { }
        with g { }
    ";
    let outcome = vm.exec_str("main", src);
    assert!(outcome.is_ok());
    assert_eq!(global_i64(&vm, "calls"), 2);
}

#[test]
fn destructuring_var_binds_each_name_in_order() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "var (a, b) = [1, 2]; var r = a + b;");
    assert!(outcome.is_ok());
    assert_eq!(global_i64(&vm, "r"), 3);
}

#[test]
fn destructuring_var_panics_on_a_length_mismatch() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "var (a, b, c) = [1, 2];");
    let panic = outcome.panic().expect("length mismatch panics");
    assert_eq!(panic.kind, PanicKind::ValueError);
}

#[test]
fn typedef_is_parsed_and_discarded() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "typedef Id = i64; var r = 1;");
    assert!(outcome.is_ok());
    assert_eq!(global_i64(&vm, "r"), 1);
}

#[test]
fn enum_members_are_reachable_through_colon_colon() {
    let mut vm = Vm::new(VmConfig::default());
    let src = "enum Color { Red, Green, Blue } var c = Color::Green;";
    let outcome = vm.exec_str("main", src);
    assert!(outcome.is_ok());
    let Some(pyro::Value::Obj(_)) = vm.global("c") else { panic!("expected c to be an enum member") };
}

#[test]
fn enum_member_access_panics_for_an_unknown_name() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "enum Color { Red } var c = Color::Purple;");
    let panic = outcome.panic().expect("unknown member access panics");
    assert_eq!(panic.kind, PanicKind::NameError);
}

#[test]
fn string_interpolation_stringifies_each_segment() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "var x = 2; var r = \"x is ${x + 1}!\";");
    assert!(outcome.is_ok());
    let Some(pyro::Value::Obj(id)) = vm.global("r") else { panic!("expected r to be a string") };
    let _ = id;
}

#[test]
fn string_interpolation_applies_a_format_specifier() {
    let mut vm = Vm::new(VmConfig::default());
    let outcome = vm.exec_str("main", "var r = \"${255;x}\";");
    assert!(outcome.is_ok());
}

/// A `SourceLoader` serving `.pyro` source straight out of a map, keyed by
/// the exact candidate path `ImportResolver::resolve` would probe under a
/// given root — same shape as `imports.rs`'s own `MapLoader` test double.
struct MapLoader(AHashMap<PathBuf, Vec<u8>>);

impl SourceLoader for MapLoader {
    fn load(&self, _dotted_path: &str, candidate: &Path) -> Option<Vec<u8>> {
        self.0.get(candidate).cloned()
    }
}

#[test]
fn import_module_binds_the_whole_module_by_its_last_path_segment() {
    let mut vm = Vm::new(VmConfig::default());
    vm.add_import_root("/root");
    let mut files = AHashMap::new();
    files.insert(PathBuf::from("/root/mathutils.pyro"), b"var answer = 42;".to_vec());
    vm.set_source_loader(Box::new(MapLoader(files)));

    let outcome = vm.exec_str("main", "import mathutils; var r = mathutils::answer;");
    assert!(outcome.is_ok());
    assert_eq!(global_i64(&vm, "r"), 42);
}

#[test]
fn import_named_members_binds_only_the_requested_names() {
    let mut vm = Vm::new(VmConfig::default());
    vm.add_import_root("/root");
    let mut files = AHashMap::new();
    files.insert(PathBuf::from("/root/mathutils.pyro"), b"var answer = 42; var other = 1;".to_vec());
    vm.set_source_loader(Box::new(MapLoader(files)));

    let outcome = vm.exec_str("main", "import mathutils::{answer}; var r = answer;");
    assert!(outcome.is_ok());
    assert_eq!(global_i64(&vm, "r"), 42);
}

#[test]
fn import_of_a_missing_module_panics_with_import_error() {
    let mut vm = Vm::new(VmConfig::default());
    vm.add_import_root("/root");
    vm.set_source_loader(Box::new(MapLoader(AHashMap::new())));

    let outcome = vm.exec_str("main", "import nosuch;");
    let panic = outcome.panic().expect("missing module panics");
    assert_eq!(panic.kind, PanicKind::ImportError);
}

#[test]
fn run_test_functions_reports_pass_and_fail() {
    let mut vm = Vm::new(VmConfig::default());
    vm.exec_str(
        "main",
        "def $test_addition() { assert 1 + 1 == 2; } def $test_broken() { assert 1 == 2, \"nope\"; }",
    );
    let results = vm.run_test_functions();
    assert_eq!(results.len(), 2);
    let addition = results.iter().find(|r| r.name == "addition").expect("addition test present");
    assert!(addition.passed);
    let broken = results.iter().find(|r| r.name == "broken").expect("broken test present");
    assert!(!broken.passed);
}
