//! Stepping throughput and the cost of snapshots and rewinds.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rewind::{Runner, RunnerConfig, Settings};
use std::hint::black_box;

fn countdown(n: u64) -> String {
    format!("(defn loop (n acc) (if (= n 0) acc (loop (- n 1) (+ acc 1)))) (loop {n} 0)")
}

fn tree(depth: u64) -> String {
    format!("(defn fib (n) (if (< n 2) n (+ (fib (- n 1)) (fib (- n 2))))) (fib {depth})")
}

fn runner(settings: Settings, source: &str) -> Runner {
    let mut runner = Runner::new(RunnerConfig::new(settings));
    if let Err(error) = runner.load(source) {
        panic!("benchmark program failed to load: {error}");
    }
    runner
}

/// Steps per iteration with and without history recording.
fn bench_stepping(c: &mut Criterion) {
    let mut group = c.benchmark_group("stepping");

    for n in [100, 1_000, 10_000] {
        let source = countdown(n);

        group.bench_with_input(BenchmarkId::new("bare", n), &source, |b, source| {
            let settings = Settings {
                keyframe_interval: 0,
                record_checkpoints: false,
                ..Settings::default()
            };
            b.iter(|| {
                let mut runner = runner(settings.clone(), source);
                black_box(runner.run_to_completion(u64::MAX).ok())
            });
        });

        group.bench_with_input(BenchmarkId::new("recording", n), &source, |b, source| {
            b.iter(|| {
                let mut runner = runner(Settings::default(), source);
                black_box(runner.run_to_completion(u64::MAX).ok())
            });
        });
    }

    group.finish();
}

/// Snapshot cost as the frame stack grows.
fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for depth in [8, 14, 18] {
        group.bench_with_input(BenchmarkId::new("fib", depth), &depth, |b, &depth| {
            let mut runner = runner(Settings::default(), &tree(depth));
            // deep inside the recursion
            let _ = runner.run_budget(depth * 40, |_| {});
            b.iter(|| black_box(runner.snapshot().ok()));
        });
    }

    group.finish();
}

/// Rewinding to the middle of a finished run.
fn bench_rewind(c: &mut Criterion) {
    let mut group = c.benchmark_group("rewind");

    for interval in [100, 1_000] {
        group.bench_with_input(
            BenchmarkId::new("keyframe_interval", interval),
            &interval,
            |b, &interval| {
                let settings = Settings {
                    keyframe_interval: interval,
                    ..Settings::default()
                };
                let mut runner = runner(settings, &countdown(2_000));
                let _ = runner.run_to_completion(u64::MAX);
                let middle = runner.step_count() / 2;
                b.iter(|| black_box(runner.rewind_to(middle).is_ok()));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_stepping, bench_snapshot, bench_rewind);
criterion_main!(benches);
