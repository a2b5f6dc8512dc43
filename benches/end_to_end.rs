//! Pass-sequence latency on the reference matmul program.
//!
//! Measures each stage separately and the whole sequence:
//! 1. Layout inference
//! 2. Pipeline scheduling
//! 3. Instruction selection
//! 4. Total (infer → schedule → select)
//! 5. Schedule simulation of one block

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tilec::infer::infer;
use tilec::kernels::{matmul, MatmulConfig};
use tilec::schedule::schedule;
use tilec::schedule::simulate::{verify, SimOptions};
use tilec::select::select_kernel;
use tilec::target::TargetCaps;
use tilec::tensor::Tolerance;

fn config(stages: u32) -> MatmulConfig {
    MatmulConfig {
        m: 1024,
        n: 1024,
        k: 1024,
        stages,
        ..MatmulConfig::default()
    }
}

/// Benchmark: each pass on its own.
fn bench_passes(c: &mut Criterion) {
    let caps = TargetCaps::sm80();
    let kernel = matmul(&config(3));
    let inferred = infer(kernel.clone(), &caps).expect("infer");
    let scheduled = schedule(inferred.kernel.clone(), &caps).expect("schedule");

    let mut group = c.benchmark_group("passes");
    group.bench_function("infer", |b| {
        b.iter(|| infer(black_box(kernel.clone()), &caps))
    });
    group.bench_function("schedule", |b| {
        b.iter(|| schedule(black_box(inferred.kernel.clone()), &caps))
    });
    group.bench_function("select", |b| {
        b.iter(|| select_kernel(black_box(scheduled.clone()), &caps))
    });
    group.finish();
}

/// Benchmark: the full sequence across stage counts and targets.
fn bench_end_to_end(c: &mut Criterion) {
    let mut group = c.benchmark_group("end_to_end");
    for target in ["sm80", "sm90", "gfx90a"] {
        let Some(caps) = TargetCaps::builtin(target) else {
            continue;
        };
        for stages in [1, 3] {
            let kernel = matmul(&config(stages));
            group.bench_function(format!("{}_s{}", target, stages), |b| {
                b.iter(|| tilec::run_passes(black_box(kernel.clone()), &caps))
            });
        }
    }
    group.finish();
}

/// Benchmark: staged vs sequential simulation of one block.
fn bench_simulate(c: &mut Criterion) {
    let caps = TargetCaps::sm80();
    let cfg = MatmulConfig {
        m: 128,
        n: 128,
        k: 256,
        block_m: 64,
        block_n: 64,
        ..config(3)
    };
    let compiled = tilec::run_passes(matmul(&cfg), &caps).expect("compile");
    let opts = SimOptions {
        max_blocks: Some(1),
        ..SimOptions::default()
    };

    c.bench_function("simulate_one_block", |b| {
        b.iter(|| verify(black_box(&compiled.kernel), &opts, Tolerance::default()))
    });
}

criterion_group!(benches, bench_passes, bench_end_to_end, bench_simulate);
criterion_main!(benches);
