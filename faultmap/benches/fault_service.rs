use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use faultmap::{Config, FaultListener, Mapping, MemStore, MockListener};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{num::NonZeroUsize, sync::Arc};

const PAGE: usize = 4096;
const REGION_PAGES: u64 = 1024;

fn bench_fault_service(c: &mut Criterion) {
    let mut group = c.benchmark_group("fault_service");
    group.throughput(Throughput::Elements(1));

    // A small buffer over a large region: nearly every fault is a miss,
    // so each iteration measures a fill plus its share of evictions.
    group.bench_function("read_fault_miss", |b| {
        let config = Config {
            page_size: PAGE,
            buffer_capacity: NonZeroUsize::new(64).unwrap(),
            low_watermark: 16,
            high_watermark: 48,
            fill_workers: NonZeroUsize::new(2).unwrap(),
            flush_workers: NonZeroUsize::new(2).unwrap(),
            max_fault_events: NonZeroUsize::new(64).unwrap(),
        };
        let store = Arc::new(MemStore::new(REGION_PAGES as usize * PAGE));
        let listener =
            Arc::new(MockListener::new(REGION_PAGES as usize * PAGE, PAGE, 64).unwrap());
        let mapping = Mapping::with_listener(config, store, listener.clone()).unwrap();
        let base = listener.base();

        let mut rng = StdRng::seed_from_u64(42);
        b.iter(|| {
            let page = rng.gen_range(0..REGION_PAGES);
            listener.raise(base + page * PAGE as u64, false).unwrap();
        });
        drop(mapping);
    });

    // All faults hit an installed page: the cost of the mock protection
    // check alone, as a baseline.
    group.bench_function("read_fault_hit", |b| {
        let config = Config {
            page_size: PAGE,
            buffer_capacity: NonZeroUsize::new(16).unwrap(),
            low_watermark: 4,
            high_watermark: 12,
            fill_workers: NonZeroUsize::new(1).unwrap(),
            flush_workers: NonZeroUsize::new(1).unwrap(),
            max_fault_events: NonZeroUsize::new(64).unwrap(),
        };
        let store = Arc::new(MemStore::new(8 * PAGE));
        let listener = Arc::new(MockListener::new(8 * PAGE, PAGE, 64).unwrap());
        let mapping = Mapping::with_listener(config, store, listener.clone()).unwrap();
        let base = listener.base();
        listener.raise(base, false).unwrap();

        b.iter(|| listener.raise(base, false).unwrap());
        drop(mapping);
    });

    group.finish();
}

criterion_group!(benches, bench_fault_service);
criterion_main!(benches);
