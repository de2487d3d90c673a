//! JIT compilation benchmarks: how fast the emitter turns bytecode into
//! native code.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use jade::config::RuntimeConfig;
use jade::vm::bytecode::{BytecodeBuilder, BytecodeModule, OpCode, RuntimeFunctionHeader};
use jade::vm::Runtime;

/// A numeric loop body with `pairs` add/inc pairs per iteration.
fn loop_body(pairs: usize) -> Vec<u8> {
    let mut b = BytecodeBuilder::new();
    b.op(OpCode::LoadConstDouble).u8(0).f64(0.0);
    b.op(OpCode::LoadConstDouble).u8(1).f64(0.0);
    b.op(OpCode::LoadConstDouble).u8(2).f64(1_000_000.0);
    let top = b.offset();
    for _ in 0..pairs {
        b.op(OpCode::AddN).u8(0).u8(0).u8(1);
        b.op(OpCode::Inc).u8(1).u8(1);
    }
    let at = b.offset();
    b.op(OpCode::JGreaterN)
        .i16((top as i64 - at as i64) as i16)
        .u8(2)
        .u8(1);
    b.op(OpCode::Ret).u8(0);
    b.finish()
}

#[cfg(feature = "jit")]
fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("jit_compile");
    for pairs in [1usize, 16, 64] {
        group.bench_with_input(BenchmarkId::new("loop", pairs), &pairs, |bench, pairs| {
            let mut builder = BytecodeModule::builder();
            builder.add_string("loop");
            let function_id = builder.add_function(
                RuntimeFunctionHeader {
                    frame_size: 8,
                    ..Default::default()
                },
                loop_body(*pairs),
                Vec::new(),
            );
            let mut runtime = Runtime::new(RuntimeConfig::default());
            let module_index = runtime.add_module(Box::new(builder.build()));
            let block = runtime
                .module_mut(module_index)
                .get_code_block_may_allocate(function_id)
                .unwrap();
            let block = unsafe { &*block };

            bench.iter(|| {
                let compiled =
                    jade::jit::compile_code_block(black_box(block), module_index, &RuntimeConfig::default()).unwrap();
                black_box(compiled.code().len())
            });
        });
    }
    group.finish();
}

#[cfg(not(feature = "jit"))]
fn bench_compile(_c: &mut Criterion) {}

criterion_group!(benches, bench_compile);
criterion_main!(benches);
