//! Hashing and metadata benchmarks for isolate-core

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use isolate_core::hash::{hash_bytes, hash_file_sized};
use isolate_core::{file_to_metadata, FileMetadata, HashAlgo};
use std::hint::black_box;

fn bench_hash_bytes(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_bytes");
    for size in [1024usize, 1024 * 1024] {
        let data = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        for algo in [HashAlgo::Sha1, HashAlgo::Blake3] {
            group.bench_with_input(BenchmarkId::new(algo.name(), size), &data, |b, data| {
                b.iter(|| hash_bytes(algo, black_box(data)))
            });
        }
    }
    group.finish();
}

fn bench_hash_file(c: &mut Criterion) {
    let temp = tempfile::tempdir().unwrap();
    let small = temp.path().join("small.bin");
    let large = temp.path().join("large.bin");
    std::fs::write(&small, vec![1u8; 64 * 1024]).unwrap();
    std::fs::write(&large, vec![2u8; 8 * 1024 * 1024]).unwrap();

    let mut group = c.benchmark_group("hash_file");
    for (name, path) in [("64k_streaming", &small), ("8m_mmap", &large)] {
        let size = std::fs::metadata(path).unwrap().len();
        group.throughput(Throughput::Bytes(size));
        group.bench_function(name, |b| {
            b.iter(|| hash_file_sized(black_box(path), size, HashAlgo::Sha1).unwrap())
        });
    }
    group.finish();
}

fn bench_metadata_fast_path(c: &mut Criterion) {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("cached.bin");
    std::fs::write(&path, vec![3u8; 1024 * 1024]).unwrap();
    let prev = file_to_metadata(&path, &FileMetadata::pending(), None, HashAlgo::Sha1).unwrap();

    c.bench_function("file_to_metadata_cold", |b| {
        b.iter(|| file_to_metadata(&path, &FileMetadata::pending(), None, HashAlgo::Sha1).unwrap())
    });
    c.bench_function("file_to_metadata_cached", |b| {
        b.iter(|| file_to_metadata(&path, black_box(&prev), None, HashAlgo::Sha1).unwrap())
    });
}

criterion_group!(
    benches,
    bench_hash_bytes,
    bench_hash_file,
    bench_metadata_fast_path
);
criterion_main!(benches);
