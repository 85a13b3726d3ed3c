// Allocation Solver Benchmarks
// Measures clearing time across bidder-set sizes and the degenerate
// infeasible-floor path.

use corebalancer::common::WorkloadId;
use corebalancer::solver::{solve, Bid};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bid_set(n: usize) -> Vec<Bid> {
    (0..n)
        .map(|i| Bid {
            id: WorkloadId::new(format!("wl-{:04}", i)),
            demand: 100.0 + (i as f64 * 37.0) % 1900.0,
            weight: 1.0 + (i % 3) as f64 * 0.1,
            min: 50 + (i as u32 * 13) % 150,
            max: 500 + (i as u32 * 91) % 1500,
        })
        .collect()
}

fn bench_clearing(c: &mut Criterion) {
    let mut group = c.benchmark_group("solver_clearing");
    for size in [2usize, 10, 50, 200] {
        let bids = bid_set(size);
        let capacity = (size as u32) * 300;
        group.bench_with_input(BenchmarkId::from_parameter(size), &bids, |b, bids| {
            b.iter(|| solve(black_box(capacity), black_box(bids)))
        });
    }
    group.finish();
}

fn bench_infeasible_floors(c: &mut Criterion) {
    let bids = bid_set(100);
    // Capacity below the floor sum exercises the scaling path.
    c.bench_function("solver_infeasible_floors", |b| {
        b.iter(|| solve(black_box(1_000), black_box(&bids)))
    });
}

criterion_group!(benches, bench_clearing, bench_infeasible_floors);
criterion_main!(benches);
