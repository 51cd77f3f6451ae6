//! Load benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use graphstore_bench::utils::{open_database, populate, sample_oids};
use graphstore_core::EvictAll;
use graphstore_testkit::{LEAF_TYPE, NODE_TYPE, ROOT_TYPE};
use std::sync::Arc;
use std::time::Duration;

/// Benchmark loading random leaves by object id from a warm cache.
fn bench_load_by_oids(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_by_oids");

    for count in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let db = open_database(4);
            let leaves = populate(&db, 10_000, 128);

            b.iter(|| {
                let oids = sample_oids(&leaves, count);
                black_box(db.load_by_oids(&oids).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark loads that have to go back to the data files.
fn bench_cold_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_load");

    group.bench_function("100_oids", |b| {
        let db = open_database(4);
        let leaves = populate(&db, 10_000, 128);

        b.iter(|| {
            db.issue_cache_check(Duration::from_secs(10), Arc::new(EvictAll))
                .unwrap();
            let oids = sample_oids(&leaves, 100);
            black_box(db.load_by_oids(&oids).unwrap());
        });
    });
    group.finish();
}

/// Benchmark loading every entity by type.
fn bench_load_by_types(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_by_types");
    group.sample_size(20);

    for count in [1_000usize, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let db = open_database(4);
            populate(&db, count, 64);

            b.iter(|| {
                black_box(db.load_by_types(&[ROOT_TYPE, NODE_TYPE, LEAF_TYPE]).unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_load_by_oids,
    bench_cold_load,
    bench_load_by_types,
);
criterion_main!(benches);
