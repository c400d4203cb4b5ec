//! Benchmarks for the storage engine (WAL + ordered memtable).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mergebox_storage::record::LogEntry;
use mergebox_storage::wal::{FsyncPolicy, Wal};
use mergebox_storage::{OrderedMap, Store};
use tempfile::TempDir;

fn bench_map_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_put");

    for size in [64, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let store = Store::open(dir.path(), FsyncPolicy::None).unwrap();
            let map = store.open_map::<u64, Vec<u8>>("bench").unwrap();

            let mut i = 0u64;
            b.iter(|| {
                map.put(i, vec![0x42u8; size]).unwrap();
                i += 1;
            });
        });
    }
    group.finish();
}

fn bench_map_get(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), FsyncPolicy::None).unwrap();
    let map = store.open_map::<u64, Vec<u8>>("bench").unwrap();

    for i in 0..1000 {
        map.put(i, vec![0x42u8; 256]).unwrap();
    }

    c.bench_function("map_get", |b| {
        let mut i = 0u64;
        b.iter(|| {
            black_box(map.get(&(i % 1000)));
            i += 1;
        });
    });
}

fn bench_map_navigation(c: &mut Criterion) {
    let store = Store::in_memory();
    let map = store.open_map::<u64, u64>("nav").unwrap();

    for i in 0..10_000 {
        map.put(i * 2, i).unwrap();
    }

    c.bench_function("map_ceiling_walk_100", |b| {
        b.iter(|| {
            let mut key = map.ceiling_key(&5_001);
            for _ in 0..100 {
                key = key.and_then(|k| map.higher_key(&k));
            }
            black_box(key);
        });
    });
}

fn bench_wal_append(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let wal_path = dir.path().join("bench.wal");
    let mut wal = Wal::open(&wal_path, FsyncPolicy::None).unwrap();

    c.bench_function("wal_append", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let entry: LogEntry<u64, Vec<u8>> = LogEntry::Put {
                key: i,
                value: vec![0x42u8; 128],
            };
            wal.append(&entry).unwrap();
            i += 1;
        });
    });
}

criterion_group!(
    benches,
    bench_map_put,
    bench_map_get,
    bench_map_navigation,
    bench_wal_append
);
criterion_main!(benches);
