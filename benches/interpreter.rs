use criterion::{Criterion, black_box, criterion_group, criterion_main};
use pyro::{Vm, VmConfig};

/// Runs `src` to completion, panicking (so a regression is visible as a
/// benchmark failure rather than a silently-wrong number) if it doesn't.
fn run(vm: &mut Vm, src: &str) {
    let outcome = vm.exec_str("bench", src);
    assert!(outcome.is_ok(), "benchmark script panicked: {:?}", outcome.panic());
    black_box(outcome);
}

const FIB_RECURSIVE: &str = "
def fib(n) {
    if n < 2 {
        return n;
    }
    return fib(n - 1) + fib(n - 2);
}
var r = fib(20);
";

const LOOP_ACCUMULATE: &str = "
var total = 0;
var i = 0;
while i < 10000 {
    total = total + i;
    i = i + 1;
}
";

const VEC_SORT: &str = "
var v = [9, 2, 7, 1, 8, 3, 6, 4, 5, 0];
var i = 0;
while i < 200 {
    v:sort();
    i = i + 1;
}
";

fn bench_fib_recursive(c: &mut Criterion) {
    c.bench_function("fib_recursive_20", |b| {
        b.iter(|| {
            let mut vm = Vm::new(VmConfig::default());
            run(&mut vm, FIB_RECURSIVE);
        });
    });
}

fn bench_loop_accumulate(c: &mut Criterion) {
    c.bench_function("loop_accumulate_10000", |b| {
        b.iter(|| {
            let mut vm = Vm::new(VmConfig::default());
            run(&mut vm, LOOP_ACCUMULATE);
        });
    });
}

fn bench_vec_sort(c: &mut Criterion) {
    c.bench_function("vec_sort_200x", |b| {
        b.iter(|| {
            let mut vm = Vm::new(VmConfig::default());
            run(&mut vm, VEC_SORT);
        });
    });
}

criterion_group!(benches, bench_fib_recursive, bench_loop_accumulate, bench_vec_sort);
criterion_main!(benches);
