//! LRU Benchmarks
//!
//! Touch and eviction throughput of the tile-slot LRU

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tessera_core::LruCache;

fn bench_touch_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("lru_touch_sequential");

    for capacity in [64u32, 1024, 16384].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), capacity, |b, &capacity| {
            let mut lru = LruCache::new(capacity);
            b.iter(|| {
                for id in 0..capacity {
                    black_box(lru.touch(id));
                }
            });
        });
    }

    group.finish();
}

fn bench_touch_strided(c: &mut Criterion) {
    let mut group = c.benchmark_group("lru_touch_strided");

    for capacity in [64u32, 1024, 16384].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), capacity, |b, &capacity| {
            let mut lru = LruCache::new(capacity);
            b.iter(|| {
                let mut id = 0u32;
                for _ in 0..capacity {
                    id = (id + 7919) % capacity;
                    black_box(lru.touch(id));
                }
            });
        });
    }

    group.finish();
}

fn bench_evict_cycle(c: &mut Criterion) {
    c.bench_function("lru_evict_cycle_1024", |b| {
        let mut lru = LruCache::new(1024);
        b.iter(|| {
            for _ in 0..1024 {
                if let Some(oldest) = lru.peek_oldest() {
                    lru.touch(black_box(oldest));
                }
            }
        });
    });
}

criterion_group!(benches, bench_touch_sequential, bench_touch_strided, bench_evict_cycle);
criterion_main!(benches);
