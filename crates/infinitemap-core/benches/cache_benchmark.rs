//! Cluster cache benchmarks: hit path, miss path and eviction churn.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use infinitemap_core::cache::{range_key, ClusterCache};

fn bench_hit_path(c: &mut Criterion) {
    let cache = ClusterCache::new(64 * 1024 * 1024);
    for i in 0..256u64 {
        cache.set(&range_key("bench.bin", i * 4096, 4096), vec![0u8; 4096]);
    }
    c.bench_function("cache_get_hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 256;
            black_box(cache.get(&range_key("bench.bin", i * 4096, 4096)))
        });
    });
}

fn bench_miss_path(c: &mut Criterion) {
    let cache = ClusterCache::new(64 * 1024 * 1024);
    c.bench_function("cache_get_miss", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(cache.get(&range_key("absent.bin", i * 4096, 4096)))
        });
    });
}

fn bench_eviction_churn(c: &mut Criterion) {
    // Capacity for 16 clusters; every set evicts.
    let cache = ClusterCache::new(16 * 4096);
    c.bench_function("cache_set_with_eviction", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(cache.set(&range_key("churn.bin", i * 4096, 4096), vec![0u8; 4096]))
        });
    });
}

criterion_group!(benches, bench_hit_path, bench_miss_path, bench_eviction_churn);
criterion_main!(benches);
