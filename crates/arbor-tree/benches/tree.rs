//! Tree benchmarks.
//!
//! Benchmarks for:
//! - Sequential file writes followed by a commit
//! - Sequential and random reads from a committed version

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use arbor_common::{Key, TreeConfig};
use arbor_storage::MemoryAreaStore;
use arbor_tree::{AccessMode, TreeSystem};

const CHUNK: usize = 1024;

fn new_system() -> TreeSystem {
    TreeSystem::create(Arc::new(MemoryAreaStore::new()), TreeConfig::default()).unwrap()
}

/// Generate a deterministic payload.
fn payload(len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..len).map(|_| rng.gen()).collect()
}

/// A system holding `files` files of `size` bytes each.
fn populated(files: i64, size: usize) -> TreeSystem {
    let system = new_system();
    let data = payload(size);
    let mut tx = system.create_transaction().unwrap();
    for i in 0..files {
        tx.get_file(Key::new(1, 0, i), AccessMode::ReadWrite)
            .unwrap()
            .write(&data)
            .unwrap();
    }
    system.commit(tx).unwrap();
    system
}

/// Benchmark appending to one file in fixed chunks, then committing.
fn bench_write_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree/write_sequential");
    let chunk = payload(CHUNK);

    for total in [64 * 1024, 1024 * 1024].iter() {
        group.throughput(Throughput::Bytes(*total as u64));
        group.bench_with_input(BenchmarkId::from_parameter(total), total, |b, &total| {
            b.iter(|| {
                let system = new_system();
                let mut tx = system.create_transaction().unwrap();
                {
                    let mut file = tx.get_file(Key::new(1, 0, 1), AccessMode::ReadWrite).unwrap();
                    for _ in 0..total / CHUNK {
                        file.write(&chunk).unwrap();
                    }
                }
                black_box(system.commit(tx).unwrap())
            });
        });
    }

    group.finish();
}

/// Benchmark reading whole files from a snapshot.
fn bench_read_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree/read_sequential");
    let system = populated(64, 16 * 1024);

    group.throughput(Throughput::Bytes(64 * 16 * 1024));
    group.bench_function("64x16k", |b| {
        b.iter(|| {
            let mut snapshot = system.create_snapshot().unwrap();
            let mut buf = vec![0; 16 * 1024];
            for i in 0..64 {
                let mut file = snapshot.get_file(Key::new(1, 0, i), AccessMode::Read).unwrap();
                file.read(&mut buf).unwrap();
            }
            black_box(buf[0])
        });
    });

    group.finish();
}

/// Benchmark small reads at random offsets across files.
fn bench_read_random(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree/read_random");
    let system = populated(64, 16 * 1024);
    let mut rng = StdRng::seed_from_u64(7);
    let lookups: Vec<(i64, u64)> = (0..1000)
        .map(|_| (rng.gen_range(0..64), rng.gen_range(0..16 * 1024 - 64)))
        .collect();

    group.throughput(Throughput::Elements(lookups.len() as u64));
    group.bench_function("1000x64b", |b| {
        b.iter(|| {
            let mut snapshot = system.create_snapshot().unwrap();
            let mut buf = [0u8; 64];
            for &(file, pos) in &lookups {
                let mut f = snapshot.get_file(Key::new(1, 0, file), AccessMode::Read).unwrap();
                f.set_position(pos);
                f.read(&mut buf).unwrap();
            }
            black_box(buf[0])
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_write_sequential,
    bench_read_sequential,
    bench_read_random
);
criterion_main!(benches);
