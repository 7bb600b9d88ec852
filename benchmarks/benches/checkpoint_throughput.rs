//! Benchmarks for checkpoint persistence and upload throughput

use bytes::Bytes;
use checkpoint::{persist_current_checkpoint, Checkpoint, StorageLayout};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use runtime_core::StorageConfig;
use std::path::Path;
use std::sync::Arc;
use storage::{upload, FileSystem, FileSystemHandle, MemoryFileSystem};
use tempfile::TempDir;

/// Write `files` files of `size` bytes each under `root`
fn write_payload(root: &Path, files: usize, size: usize) {
    std::fs::create_dir_all(root).unwrap();
    let data = vec![0u8; size];
    for i in 0..files {
        std::fs::write(root.join(format!("shard_{:03}.bin", i)), &data).unwrap();
    }
}

fn persist_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("checkpoint_persist");

    for size in [1_000_000, 10_000_000, 50_000_000].iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        write_payload(&source, 1, *size);
        let checkpoint = Checkpoint::from_directory(&source);

        group.bench_function(format!("{}MB", size / 1_000_000), |b| {
            b.to_async(&rt).iter(|| async {
                let cache = TempDir::new().unwrap();
                let layout = StorageLayout::builder("bench")
                    .storage_path("bucket")
                    .filesystem(Arc::new(MemoryFileSystem::new()))
                    .trial_dir_name("t0")
                    .config(StorageConfig::default().with_local_cache_dir(cache.path()))
                    .create()
                    .await
                    .unwrap();
                persist_current_checkpoint(&layout, &checkpoint).await.unwrap();
            });
        });
    }

    group.finish();
}

fn upload_many_files(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("upload_files");

    for files in [16, 128, 512].iter() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        write_payload(&source, *files, 16 * 1024);

        group.throughput(Throughput::Elements(*files as u64));
        group.bench_with_input(BenchmarkId::from_parameter(files), files, |b, _| {
            b.to_async(&rt).iter(|| async {
                let remote: FileSystemHandle = Arc::new(MemoryFileSystem::new());
                upload(&source, &remote, "bucket/exp", &["*.tmp".to_string()])
                    .await
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn memory_store_writes(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("memory_write_1MB", |b| {
        let fs = MemoryFileSystem::new();
        let data = Bytes::from(vec![0u8; 1_000_000]);
        b.to_async(&rt).iter(|| async {
            let key = format!("bucket/{}", uuid::Uuid::new_v4());
            fs.write_file(&key, data.clone()).await.unwrap();
        });
    });
}

criterion_group!(
    benches,
    persist_benchmark,
    upload_many_files,
    memory_store_writes,
);
criterion_main!(benches);
