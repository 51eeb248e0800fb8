//! Benchmark suite for the dispatch loop.
//!
//! Measures a tight arithmetic loop, a recursive call chain and an
//! allocation-heavy loop that keeps the allocator on its reuse path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use zln_vm::emit::asm::{call, halt, ldc_i32, mov, op3, ret, st_glb};
use zln_vm::emit::ProgramBuilder;
use zln_vm::{Addr, Instruction, OpCode, RuntimeConfig, Type};

// ---------------------------------------------------------------------------
// Benchmark programs
// ---------------------------------------------------------------------------

/// Sum 0..n into global 0.
fn counting_loop(n: i32) -> (ProgramBuilder, Addr) {
    let mut b = ProgramBuilder::new();
    let main = b.begin_function("main", 0, 5, Type::Void);
    b.emit(ldc_i32(1, 0));
    b.emit(ldc_i32(2, 0));
    b.emit(ldc_i32(3, n));
    b.emit(ldc_i32(4, 1));
    let top = b.pc();
    b.emit(op3(OpCode::LtI32, 5, 1, 3));
    let exit = b.emit(Instruction::reg_imm(OpCode::BrZero, 5, 0));
    b.emit(op3(OpCode::AddI32, 2, 2, 1));
    b.emit(op3(OpCode::AddI32, 1, 1, 4));
    b.emit(Instruction::imm(OpCode::Br, top));
    let end = b.pc();
    b.emit(st_glb(OpCode::StGlbI32, 2, 0));
    b.emit(halt());
    // patch_imm only fails on instructions without an immediate
    let _ = b.patch_imm(exit, end);
    (b, main)
}

/// Naive fibonacci.
fn fibonacci(n: i32) -> (ProgramBuilder, Addr) {
    let mut b = ProgramBuilder::new().stack_depth(64);
    let fib = b.declare_function("fib", 1, 5, Type::Int32);
    let main = b.begin_function("main", 0, 2, Type::Void);
    b.emit(ldc_i32(1, n));
    b.emit(call(2, 1, fib));
    b.emit(st_glb(OpCode::StGlbI32, 2, 0));
    b.emit(halt());

    b.define_function(fib);
    b.emit(ldc_i32(2, 2));
    b.emit(op3(OpCode::LtI32, 3, 1, 2));
    let recurse = b.emit(Instruction::reg_imm(OpCode::BrZero, 3, 0));
    b.emit(mov(0, 1));
    b.emit(ret());
    let body = b.pc();
    b.emit(ldc_i32(2, 1));
    b.emit(op3(OpCode::SubI32, 4, 1, 2));
    b.emit(call(3, 4, fib));
    b.emit(op3(OpCode::SubI32, 4, 4, 2));
    b.emit(call(5, 4, fib));
    b.emit(op3(OpCode::AddI32, 0, 3, 5));
    b.emit(ret());
    let _ = b.patch_imm(recurse, body);
    (b, main)
}

/// Allocate `n` short-lived arrays in a small heap.
fn churn(n: i32) -> (ProgramBuilder, Addr) {
    let mut b = ProgramBuilder::new().heap_size(4096);
    let main = b.begin_function("main", 0, 6, Type::Void);
    b.emit(ldc_i32(1, 0));
    b.emit(ldc_i32(2, n));
    b.emit(ldc_i32(3, 1));
    b.emit(ldc_i32(4, 16));
    let top = b.pc();
    b.emit(op3(OpCode::LtI32, 5, 1, 2));
    let exit = b.emit(Instruction::reg_imm(OpCode::BrZero, 5, 0));
    b.emit(Instruction::reg2(OpCode::NewArrI32, 6, 4));
    b.emit(op3(OpCode::StElemI32, 1, 6, 3));
    b.emit(op3(OpCode::AddI32, 1, 1, 3));
    b.emit(Instruction::imm(OpCode::Br, top));
    let end = b.pc();
    b.emit(halt());
    let _ = b.patch_imm(exit, end);
    (b, main)
}

fn run_once(program: &(ProgramBuilder, Addr)) {
    let (b, entry) = program;
    if let Ok(mut loaded) = b.load(*entry) {
        black_box(loaded.run(RuntimeConfig::new()).ok());
    }
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_counting_loop(c: &mut Criterion) {
    let program = counting_loop(10_000);
    c.bench_function("dispatch_counting_loop_10k", |b| b.iter(|| run_once(&program)));
}

fn bench_fibonacci(c: &mut Criterion) {
    let program = fibonacci(20);
    c.bench_function("dispatch_fibonacci_20", |b| b.iter(|| run_once(&program)));
}

fn bench_alloc_churn(c: &mut Criterion) {
    let program = churn(2_000);
    c.bench_function("dispatch_alloc_churn_2k", |b| b.iter(|| run_once(&program)));
}

criterion_group!(
    benches,
    bench_counting_loop,
    bench_fibonacci,
    bench_alloc_churn
);
criterion_main!(benches);
