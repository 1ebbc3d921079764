//! Performance benchmarks for the entity store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use entitydb::{EntityStore, StoreConfig, User};
use tempfile::TempDir;

fn create_store(dir: &TempDir) -> EntityStore {
    EntityStore::open(StoreConfig {
        path: dir.path().join("store"),
        reclaim_interval: None,
        ..Default::default()
    })
    .unwrap()
}

fn seeded_store(dir: &TempDir, entities: usize) -> EntityStore {
    let store = create_store(dir);
    for i in 0..entities {
        store
            .put(User {
                email: format!("user{:06}@example.com", i),
                name: format!("User {}", i),
                ..Default::default()
            })
            .unwrap();
    }
    store
}

/// Benchmark single-entity writes
fn bench_put(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);

    let mut i = 0u64;
    c.bench_function("put_user", |b| {
        b.iter(|| {
            i += 1;
            black_box(
                store
                    .put(User {
                        email: format!("bench{}@example.com", i),
                        name: "Bench".to_string(),
                        ..Default::default()
                    })
                    .unwrap(),
            );
        });
    });
}

/// Benchmark point lookups against varying store sizes
fn bench_get_one(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_one");

    for size in [100, 1000, 10000] {
        group.bench_with_input(BenchmarkId::new("entities", size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let store = seeded_store(&dir, size);
            let key = format!("user{:06}@example.com", size / 2);

            b.iter(|| {
                black_box(store.get_one::<User>(&key).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark full scans with varying store sizes
fn bench_full_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_scan");

    for size in [100, 1000, 10000] {
        group.bench_with_input(BenchmarkId::new("entities", size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let store = seeded_store(&dir, size);

            b.iter(|| {
                black_box(store.get::<User>(&[]).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark prefix scans against a fixed-size store
fn bench_prefix_scan(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir, 10000);

    // One thousandth of the keyspace shares this prefix.
    c.bench_function("prefix_scan_10k", |b| {
        b.iter(|| {
            black_box(store.get_by_prefix::<User>("user00500").unwrap());
        });
    });
}

/// Benchmark pattern scans against a fixed-size store
fn bench_pattern_scan(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir, 10000);

    c.bench_function("pattern_scan_10k", |b| {
        b.iter(|| {
            black_box(
                store
                    .get_by_pattern::<User>(r"user00\d{3}@example\.com")
                    .unwrap(),
            );
        });
    });
}

/// Benchmark keys-only listing (no value decode)
fn bench_list_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_keys");

    for size in [1000, 10000] {
        group.bench_with_input(BenchmarkId::new("entities", size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let store = seeded_store(&dir, size);

            b.iter(|| {
                black_box(store.list_keys::<User>().unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_put,
    bench_get_one,
    bench_full_scan,
    bench_prefix_scan,
    bench_pattern_scan,
    bench_list_keys,
);

criterion_main!(benches);
