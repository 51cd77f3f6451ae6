//! Garbage collection and file cleanup benchmarks.

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use graphstore_bench::utils::{drop_leaves, open_database, populate};
use graphstore_core::Database;
use graphstore_testkit::test_config;
use std::time::Duration;

const BUDGET: Duration = Duration::from_secs(60);

/// Benchmark full collections that sweep half of the graph.
fn bench_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection");
    group.sample_size(10);

    for channels in [1u32, 4].iter() {
        for count in [1_000usize, 10_000].iter() {
            group.throughput(Throughput::Elements(*count as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{channels}_channels"), count),
                count,
                |b, &count| {
                    b.iter_batched(
                        || {
                            let db = open_database(*channels);
                            let leaves = populate(&db, count, 64);
                            drop_leaves(&db, &leaves, count / 2);
                            db
                        },
                        |db| assert!(db.issue_garbage_collection(BUDGET).unwrap()),
                        BatchSize::PerIteration,
                    );
                },
            );
        }
    }
    group.finish();
}

/// Benchmark a file cleanup pass over files emptied by collection.
fn bench_file_cleanup(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_cleanup");
    group.sample_size(10);

    group.bench_function("10000_leaves", |b| {
        b.iter_batched(
            || {
                let config = test_config(2).file_sizes(0, 256 * 1024);
                let db = Database::open_in_memory(config).unwrap();
                let leaves = populate(&db, 10_000, 256);
                drop_leaves(&db, &leaves, 1_000);
                assert!(db.issue_garbage_collection(BUDGET).unwrap());
                db
            },
            |db| assert!(db.issue_file_check(BUDGET).unwrap()),
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_collection, bench_file_cleanup);
criterion_main!(benches);
