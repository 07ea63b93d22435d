//! Throughput benchmarks for Sluice streams.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sluice::prelude::*;
use std::hint::black_box;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_map_filter(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("map_filter");

    for count in [1_000i64, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.to_async(&rt).iter(|| async move {
                let sum = Stream::<i64>::range(1, count)
                    .map(|n| n * 3)
                    .filter(|n| n % 2 == 0)
                    .run_fold(0i64, |acc, n| acc + n)
                    .await
                    .unwrap();
                black_box(sum)
            });
        });
    }

    group.finish();
}

fn bench_chunk_size(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("chunk_size");
    let count = 50_000i64;
    group.throughput(Throughput::Elements(count as u64));

    for size in [1usize, 16, 256, 4096].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let n = Stream::<i64>::range_with_chunk_size(1, count, size)
                    .map(|n| n + 1)
                    .run_count()
                    .await
                    .unwrap();
                black_box(n)
            });
        });
    }

    group.finish();
}

fn bench_rechunk(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("rechunk");
    let count = 50_000i64;
    group.throughput(Throughput::Elements(count as u64));

    for size in [7usize, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let n = Stream::<i64>::range_with_chunk_size(1, count, 64)
                    .rechunk(size)
                    .run_count()
                    .await
                    .unwrap();
                black_box(n)
            });
        });
    }

    group.finish();
}

fn bench_buffer(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("buffer");
    let count = 20_000i64;
    group.throughput(Throughput::Elements(count as u64));

    for capacity in [1usize, 16, 256].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), capacity, |b, &capacity| {
            b.to_async(&rt).iter(|| async move {
                let n = Stream::<i64>::range_with_chunk_size(1, count, 16)
                    .buffer(capacity, OverflowStrategy::Suspend)
                    .run_count()
                    .await
                    .unwrap();
                black_box(n)
            });
        });
    }

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("merge");
    let per_side = 10_000i64;
    group.throughput(Throughput::Elements(2 * per_side as u64));

    group.bench_function("two_ranges", |b| {
        b.to_async(&rt).iter(|| async move {
            let n = Stream::<i64>::range(1, per_side)
                .merge(Stream::range(1, per_side))
                .run_count()
                .await
                .unwrap();
            black_box(n)
        });
    });

    group.finish();
}

fn bench_flat_map(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("flat_map");
    let outer = 100i64;
    let inner = 100i64;
    group.throughput(Throughput::Elements((outer * inner) as u64));

    for concurrency in [1usize, 4, 16].iter() {
        group.bench_with_input(
            BenchmarkId::new("concurrency", concurrency),
            concurrency,
            |b, &concurrency| {
                b.to_async(&rt).iter(|| async move {
                    let options = if concurrency == 1 {
                        FlatMapOptions::default()
                    } else {
                        FlatMapOptions::concurrent(concurrency)
                    };
                    let n = Stream::<i64>::range(1, outer)
                        .flat_map(move |_| Stream::range(1, inner), options)
                        .run_count()
                        .await
                        .unwrap();
                    black_box(n)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_map_filter,
    bench_chunk_size,
    bench_rechunk,
    bench_buffer,
    bench_merge,
    bench_flat_map,
);

criterion_main!(benches);
