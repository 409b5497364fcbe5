//! Benchmark suite for loadcache operations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use loadcache::sync::{from_fn, Cache, CacheLoader};
use std::{collections::HashMap, sync::Arc, thread, time::Duration};

fn new_cache(max_capacity: u64) -> Cache<u64, String> {
    Cache::builder()
        .max_capacity(max_capacity)
        .build(from_fn(|key: &u64| Ok(format!("value-{}", key))))
        .expect("valid config")
}

/// Benchmark loading of missing entries into an empty cache.
fn load_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("load");

    for size in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let cache = new_cache(size);
                for i in 0..size {
                    let _ = cache.get(black_box(i));
                }
            });
        });
    }
    group.finish();
}

/// Benchmark hits on a pre-populated cache.
fn get_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");

    for size in [100, 1000, 10000].iter() {
        let cache = new_cache(*size);
        for i in 0..*size {
            cache.put(i, format!("value-{}", i));
        }

        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    let _ = cache.get_if_present(&black_box(i));
                }
            });
        });
    }
    group.finish();
}

/// Benchmark a mix of puts, loading reads and `contains_key` calls.
fn mixed_operations_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_ops");

    for size in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let cache = new_cache(size);
                for i in 0..size {
                    if i % 3 == 0 {
                        cache.put(black_box(i), black_box(format!("value-{}", i)));
                    } else if i % 3 == 1 {
                        let _ = cache.get(black_box(i));
                    } else {
                        let _ = cache.contains_key(&black_box(i));
                    }
                }
            });
        });
    }
    group.finish();
}

/// Loads 2,000 entries into a cache with capacity of 1,000.
fn eviction_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("eviction");

    let cache_size = 1000;
    let load_count = 2000;

    group.throughput(Throughput::Elements(load_count));
    group.bench_function("lru_eviction", |b| {
        b.iter(|| {
            let cache = new_cache(cache_size);
            for i in 0..load_count {
                let _ = cache.get(black_box(i));
            }
        });
    });

    group.finish();
}

struct BulkLoader;

impl CacheLoader<u64, String> for BulkLoader {
    fn load(&self, key: &u64) -> Result<String, loadcache::BoxError> {
        Ok(format!("value-{}", key))
    }

    fn load_all(
        &self,
        keys: &[Arc<u64>],
    ) -> Option<Result<HashMap<u64, String>, loadcache::BoxError>> {
        Some(Ok(keys
            .iter()
            .map(|k| (**k, format!("value-{}", k)))
            .collect()))
    }
}

/// Compares `get_all` with a bulk loader to `get_all` falling back to `load`.
fn get_all_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_all");
    let batch = 100u64;
    group.throughput(Throughput::Elements(batch));

    group.bench_function("bulk_loader", |b| {
        b.iter(|| {
            let cache = Cache::builder()
                .max_capacity(1000)
                .build(BulkLoader)
                .expect("valid config");
            let _ = cache.get_all(black_box(0..batch));
        });
    });
    group.bench_function("per_key_loader", |b| {
        b.iter(|| {
            let cache = new_cache(1000);
            let _ = cache.get_all(black_box(0..batch));
        });
    });

    group.finish();
}

/// Reads from several threads while the entries are being refreshed.
fn concurrent_get_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_get");
    let size = 1000u64;
    let num_threads = 4;

    let cache = Cache::builder()
        .max_capacity(size)
        .refresh_after_write(Duration::from_millis(1))
        .build(from_fn(|key: &u64| Ok(format!("value-{}", key))))
        .expect("valid config");
    for i in 0..size {
        cache.put(i, format!("value-{}", i));
    }

    group.throughput(Throughput::Elements(size * num_threads));
    group.bench_function("refresh_ahead", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..num_threads)
                .map(|_| {
                    let cache = cache.clone();
                    thread::spawn(move || {
                        for i in 0..size {
                            let _ = cache.get(black_box(i));
                        }
                    })
                })
                .collect();
            for handle in handles {
                let _ = handle.join();
            }
        });
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(100);
    targets = load_benchmark, get_benchmark, mixed_operations_benchmark, eviction_benchmark,
              get_all_benchmark, concurrent_get_benchmark
}

criterion_main!(benches);
