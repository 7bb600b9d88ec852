//! Checkpoint persistence
//!
//! Copies a checkpoint from wherever the caller produced it into the layout's
//! current checkpoint directory on durable storage:
//!
//! 1. check the validation marker
//! 2. create the checkpoint directory
//! 3. copy the payload
//!
//! Several workers may persist shards into the same directory; each copies
//! only its own files. The source is never deleted.

use std::time::Instant;

use runtime_core::Result;
use storage::{copy_files, CopyOptions};
use tracing::{info, instrument};

use crate::handle::Checkpoint;
use crate::layout::StorageLayout;
use crate::validation;

/// Persist `source` as the layout's current checkpoint.
///
/// Returns a handle to the durable copy. Transfer failures propagate as-is;
/// only an unreachable storage location is reported as `StorageUnreachable`.
#[instrument(skip(layout, source), fields(source = %source, index = layout.current_checkpoint_index()))]
pub async fn persist_current_checkpoint(
    layout: &StorageLayout,
    source: &Checkpoint,
) -> Result<Checkpoint> {
    let started = Instant::now();
    let destination = layout.checkpoint_fs_path()?;
    layout.ensure_checkpoint_index_unused()?;

    validation::check(layout).await?;

    let filesystem = layout.filesystem();
    filesystem.create_dir(&destination).await?;

    let stats = copy_files(
        source.filesystem(),
        source.path(),
        filesystem,
        &destination,
        CopyOptions::default(),
    )
    .await?;

    layout.claim_checkpoint_index()?;

    info!(
        destination = %layout.storage_prefix().uri_for(&destination),
        files = stats.files,
        bytes = stats.bytes,
        elapsed_ms = started.elapsed().as_millis(),
        "Checkpoint persisted"
    );
    Ok(Checkpoint::new(filesystem.clone(), destination))
}
