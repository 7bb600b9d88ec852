//! End-to-end scenarios: a driver creates the experiment layout, workers
//! rebuild it from the same inputs, persist checkpoints and sync results.

use anyhow::Result;
use checkpoint::{
    persist_current_checkpoint, Checkpoint, StorageLayout, SyncEngine, VALIDATION_MARKER,
};
use runtime_core::{Error, StorageConfig, SyncConfig};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::{list_at, FileSystemHandle, LocalFileSystem, MemoryFileSystem, SubTreeFileSystem};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn config_in(dir: &TempDir) -> StorageConfig {
    runtime_core::init_tracing("warn");
    StorageConfig::default()
        .with_local_cache_dir(dir.path().join("cache"))
        .with_sync(SyncConfig {
            sync_period: Duration::from_secs(3600),
            ..Default::default()
        })
}

/// Unique bucket in the process-wide `mem://` store
fn unique_bucket() -> String {
    format!("bucket-{}", uuid::Uuid::new_v4())
}

fn write_files(root: &Path, files: &[&str]) {
    for rel in files {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, rel.as_bytes()).unwrap();
    }
}

fn local_files(root: &Path) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap();
                out.insert(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    out
}

#[tokio::test]
async fn test_persist_to_memory_uri() -> Result<()> {
    let dir = TempDir::new()?;
    let bucket = unique_bucket();

    let mut layout = StorageLayout::builder("exp")
        .storage_path(format!("mem://{}", bucket))
        .trial_dir_name("t1")
        .config(config_in(&dir))
        .create()
        .await?;
    layout.set_checkpoint_index(3)?;

    assert_eq!(
        layout.checkpoint_uri()?,
        format!("mem://{}/exp/t1/checkpoint_000003", bucket)
    );
    assert_eq!(
        layout.checkpoint_fs_path()?,
        format!("{}/exp/t1/checkpoint_000003", bucket)
    );

    let source_dir = dir.path().join("produced");
    write_files(&source_dir, &["a.bin"]);
    let persisted =
        persist_current_checkpoint(&layout, &Checkpoint::from_directory(&source_dir)).await?;

    assert_eq!(persisted.path(), layout.checkpoint_fs_path()?);
    let names = list_at(persisted.filesystem().as_ref(), persisted.path()).await?;
    assert_eq!(names, vec!["a.bin"]);

    let experiment = list_at(layout.filesystem().as_ref(), &layout.experiment_fs_path()).await?;
    assert!(experiment.contains(&VALIDATION_MARKER.to_string()));
    Ok(())
}

#[tokio::test]
async fn test_workers_rebuild_layout_and_persist_shards() -> Result<()> {
    let dir = TempDir::new()?;
    let bucket = unique_bucket();
    let storage_path = format!("mem://{}/results?region=test", bucket);

    let driver = StorageLayout::builder("exp")
        .storage_path(storage_path.clone())
        .config(config_in(&dir))
        .create()
        .await?;

    let mut persisted = Vec::new();
    for rank in 0..2 {
        let worker = StorageLayout::builder("exp")
            .storage_path(storage_path.clone())
            .trial_dir_name("t1")
            .checkpoint_index(1)
            .config(config_in(&dir))
            .open()
            .await?;
        assert_eq!(worker.experiment_fs_path(), driver.experiment_fs_path());
        assert_eq!(worker.experiment_uri(), driver.experiment_uri());

        let shard = dir.path().join(format!("shard-{}", rank));
        write_files(&shard, &[&format!("rank_{}.bin", rank)]);
        persisted.push(persist_current_checkpoint(&worker, &Checkpoint::from_directory(&shard)).await?);
    }

    assert_eq!(persisted[0].path(), persisted[1].path());
    assert_eq!(
        driver.storage_prefix().uri_for(persisted[0].path()),
        format!("mem://{}/results/exp/t1/checkpoint_000001?region=test", bucket)
    );
    let names = list_at(persisted[0].filesystem().as_ref(), persisted[0].path()).await?;
    assert_eq!(names, vec!["rank_0.bin", "rank_1.bin"]);
    Ok(())
}

#[tokio::test]
async fn test_unestablished_storage_is_unreachable() -> Result<()> {
    let dir = TempDir::new()?;
    let worker = StorageLayout::builder("never-created")
        .storage_path(format!("mem://{}", unique_bucket()))
        .trial_dir_name("t1")
        .config(config_in(&dir))
        .open()
        .await?;

    let source = dir.path().join("ckpt");
    write_files(&source, &["model.bin"]);
    let result = persist_current_checkpoint(&worker, &Checkpoint::from_directory(&source)).await;

    match result {
        Err(Error::StorageUnreachable { storage_path, .. }) => {
            assert!(storage_path.starts_with("mem://"));
        }
        other => panic!("expected StorageUnreachable, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_sync_with_excludes_then_restore() -> Result<()> {
    let dir = TempDir::new()?;
    let layout = StorageLayout::builder("exp")
        .storage_path(format!("mem://{}", unique_bucket()))
        .trial_dir_name("t1")
        .config(config_in(&dir))
        .create()
        .await?;

    let trial_local = layout.trial_local_path()?;
    write_files(
        &trial_local,
        &[
            "result.json",
            "events.out",
            "checkpoint_000000/model.bin",
            "checkpoint_000000/model.png",
            "tmp/scratch/a.bin",
        ],
    );

    let engine = SyncEngine::for_layout(&layout)?.expect("remote storage needs syncing");
    let exclude = vec!["*.png".to_string(), "tmp/*".to_string()];
    engine.schedule_upload(&trial_local, layout.trial_fs_path()?, &exclude)?;
    engine.wait_until_idle(WAIT).await?;

    let restored = dir.path().join("restored");
    engine.download(&layout.trial_fs_path()?, &restored).await?;

    let expected: BTreeSet<String> = ["result.json", "events.out", "checkpoint_000000/model.bin"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(local_files(&restored), expected);

    engine.delete(&layout.trial_fs_path()?).await;
    assert!(list_at(layout.filesystem().as_ref(), &layout.trial_fs_path()?)
        .await?
        .is_empty());
    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_custom_filesystem_with_bare_path() -> Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path().join("custom_root");
    let custom: FileSystemHandle = Arc::new(SubTreeFileSystem::new(
        root.to_string_lossy().to_string(),
        Arc::new(LocalFileSystem::new()),
    ));

    let layout = StorageLayout::builder("exp")
        .storage_path("mock_bucket/results")
        .filesystem(custom.clone())
        .trial_dir_name("t1")
        .config(config_in(&dir))
        .create()
        .await?;
    assert!(layout.syncing_needed());
    assert_eq!(layout.storage_prefix().to_string(), ".");
    assert_eq!(layout.checkpoint_uri()?, "mock_bucket/results/exp/t1/checkpoint_000000");

    let source = dir.path().join("ckpt");
    write_files(&source, &["weights/layer0.bin"]);
    let persisted = persist_current_checkpoint(&layout, &Checkpoint::from_directory(&source)).await?;

    assert!(root
        .join("mock_bucket/results/exp/t1/checkpoint_000000/weights/layer0.bin")
        .exists());

    let restored = dir.path().join("restored");
    persisted.to_directory(&restored).await?;
    assert_eq!(local_files(&restored), BTreeSet::from(["weights/layer0.bin".to_string()]));
    Ok(())
}

#[tokio::test]
async fn test_uri_with_explicit_filesystem_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let result = StorageLayout::builder("exp")
        .storage_path("s3://bucket/p")
        .filesystem(Arc::new(MemoryFileSystem::new()))
        .config(config_in(&dir))
        .create()
        .await;

    let err = result.expect_err("ambiguous storage configuration");
    assert!(err.is_configuration_error());
    assert!(!err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn test_local_cache_is_durable_store_by_default() -> Result<()> {
    let dir = TempDir::new()?;
    let layout = StorageLayout::builder("exp")
        .trial_dir_name("t1")
        .config(config_in(&dir))
        .create()
        .await?;

    assert!(SyncEngine::for_layout(&layout)?.is_none());
    assert!(layout.experiment_local_path().join(VALIDATION_MARKER).exists());

    let source = dir.path().join("ckpt");
    write_files(&source, &["state.bin"]);
    persist_current_checkpoint(&layout, &Checkpoint::from_directory(&source)).await?;
    assert!(layout.checkpoint_local_path()?.join("state.bin").exists());
    Ok(())
}
