use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use ellog::core::{AngleRecord, LogStore, StoreConfig};

const APPENDS_PER_ITER: u64 = 1_000;

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    for &sync in &[false, true] {
        let label = if sync { "fsync" } else { "no_fsync" };
        group.bench_with_input(BenchmarkId::from_parameter(label), &sync, |b, &sync| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let config = StoreConfig {
                        sync_each_append: sync,
                        ..StoreConfig::default()
                    };
                    let store = LogStore::open_with_config(dir.path(), config).expect("store");
                    (dir, store)
                },
                |(_dir, store)| {
                    for i in 0..APPENDS_PER_ITER {
                        let record = AngleRecord::new(i, i as f64 * 0.01, false);
                        store.append(black_box(&record)).expect("append");
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_tail(c: &mut Criterion) {
    let dir = tempdir().expect("tempdir");
    let config = StoreConfig {
        sync_each_append: false,
        ..StoreConfig::default()
    };
    let store = LogStore::open_with_config(dir.path(), config).expect("store");
    for i in 0..10_000 {
        store
            .append(&AngleRecord::new(i, i as f64 * 0.01, true))
            .expect("append");
    }
    c.bench_function("tail_from_start", |b| {
        b.iter(|| {
            let chunk = store.tail_from(black_box(0)).expect("tail");
            black_box(chunk.records.len())
        });
    });
}

criterion_group!(benches, bench_append, bench_tail);
criterion_main!(benches);
