//! Staging area benchmarks.

use batchsync_bench::random_data;
use batchsync_storage::{FileStaging, InMemoryStaging, ResourceState, StagingKey, StagingStore};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;

fn stage(staging: &dyn StagingStore, batch_id: u64, data: &[u8]) {
    let key = StagingKey::outgoing("001", batch_id);
    let resource = staging.create(&key).unwrap();
    for chunk in data.chunks(8192) {
        resource.append(chunk).unwrap();
    }
    resource.set_state(ResourceState::Done).unwrap();
    resource.close().unwrap();
    resource.delete().unwrap();
}

/// Benchmark staging a batch in memory.
fn bench_memory_stage(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_stage");

    for size in [4096, 65536, 1 << 20].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let staging = InMemoryStaging::new();
            let data = random_data(size);
            let mut batch_id = 0;
            b.iter(|| {
                batch_id += 1;
                stage(&staging, batch_id, black_box(&data));
            });
        });
    }
    group.finish();
}

/// Benchmark staging a batch on disk.
fn bench_file_stage(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_stage");

    for size in [4096, 65536, 1 << 20].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let dir = tempdir().unwrap();
            let staging = FileStaging::open(dir.path()).unwrap();
            let data = random_data(size);
            let mut batch_id = 0;
            b.iter(|| {
                batch_id += 1;
                stage(&staging, batch_id, black_box(&data));
            });
        });
    }
    group.finish();
}

/// Benchmark checksum verification of a complete resource.
fn bench_verify(c: &mut Criterion) {
    let staging = InMemoryStaging::new();
    let resource = staging.create(&StagingKey::outgoing("001", 1)).unwrap();
    resource.append(&random_data(1 << 20)).unwrap();
    resource.set_state(ResourceState::Done).unwrap();

    c.bench_function("verify_1mib", |b| {
        b.iter(|| resource.verify().unwrap());
    });
}

criterion_group!(benches, bench_memory_stage, bench_file_stage, bench_verify);
criterion_main!(benches);
