use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use crossbeam_utils::sync::WaitGroup;
use rand::prelude::*;
use workerpool::{GrowthPolicy, Pool, PoolOption, RayonPool, WorkerPool};

const TASKS: u64 = 10_000;

type Job = (u64, WaitGroup);

fn summing_handler(sum: &Arc<AtomicU64>) -> impl Fn(Job) + Send + Sync + 'static {
    let sum = Arc::clone(sum);
    move |(value, done): Job| {
        sum.fetch_add(value, Ordering::Relaxed);
        drop(done);
    }
}

/// Submits every payload and waits for all handlers to finish.
fn run_batch(pool: &dyn WorkerPool<Job>, payloads: &[u64]) {
    let wg = WaitGroup::new();
    for &value in payloads {
        pool.serve((value, wg.clone())).unwrap();
    }
    wg.wait();
}

fn serve_bench(c: &mut Criterion) {
    let workers = num_cpus::get();
    let mut rng = thread_rng();
    let payloads: Vec<u64> = (0..TASKS).map(|_| rng.gen_range(0..1_000)).collect();
    let sum = Arc::new(AtomicU64::new(0));

    let mut group = c.benchmark_group("serve");

    let fixed = Pool::new(
        summing_handler(&sum),
        vec![PoolOption::MaxWorkers(workers)],
    )
    .unwrap();
    group.bench_function(BenchmarkId::new("fixed", workers), |b| {
        b.iter(|| run_batch(&fixed, &payloads))
    });
    fixed.stop().unwrap();

    let handoff = Pool::new(
        summing_handler(&sum),
        vec![PoolOption::MaxWorkers(workers), PoolOption::QueueCapacity(0)],
    )
    .unwrap();
    group.bench_function(BenchmarkId::new("handoff", workers), |b| {
        b.iter(|| run_batch(&handoff, &payloads))
    });
    handoff.stop().unwrap();

    let on_demand = Pool::new(
        summing_handler(&sum),
        vec![
            PoolOption::MaxWorkers(TASKS as usize),
            PoolOption::Growth(GrowthPolicy::OnDemand),
        ],
    )
    .unwrap();
    group.bench_function(BenchmarkId::new("on_demand", TASKS), |b| {
        b.iter(|| run_batch(&on_demand, &payloads))
    });
    on_demand.stop().unwrap();

    let rayon = RayonPool::new(
        summing_handler(&sum),
        vec![PoolOption::MaxWorkers(workers)],
    )
    .unwrap();
    group.bench_function(BenchmarkId::new("rayon", workers), |b| {
        b.iter(|| run_batch(&rayon, &payloads))
    });
    rayon.stop().unwrap();

    group.finish();
}

criterion_group!(benches, serve_bench);
criterion_main!(benches);
