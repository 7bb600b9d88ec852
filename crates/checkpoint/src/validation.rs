//! Storage reachability gate
//!
//! The process owning the experiment writes a zero-byte marker at the
//! experiment root; every other process checks for it before trusting a
//! remote write to be visible cluster-wide.

use bytes::Bytes;
use runtime_core::{Error, Result};
use storage::join_path;
use tracing::{debug, error, info};

use crate::layout::StorageLayout;

/// Marker file name directly under the experiment directory
pub const VALIDATION_MARKER: &str = ".validate_storage_marker";

/// Filesystem path of the layout's validation marker
pub fn marker_fs_path(layout: &StorageLayout) -> String {
    join_path(&layout.experiment_fs_path(), VALIDATION_MARKER)
}

/// Create the experiment directory and write the validation marker
pub async fn establish(layout: &StorageLayout) -> Result<()> {
    let fs = layout.filesystem();
    let experiment = layout.experiment_fs_path();
    let marker = marker_fs_path(layout);

    fs.create_dir(&experiment).await?;
    fs.write_file(&marker, Bytes::new()).await?;

    info!(
        backend = fs.type_name(),
        marker = %marker,
        "Storage validation marker written"
    );
    Ok(())
}

/// Fail with `StorageUnreachable` unless the validation marker is visible
pub async fn check(layout: &StorageLayout) -> Result<()> {
    let fs = layout.filesystem();
    let marker = marker_fs_path(layout);

    let visible = match fs.stat(&marker).await {
        Ok(info) => info.exists(),
        Err(e) => {
            error!(
                backend = fs.type_name(),
                marker = %marker,
                error = %e,
                "Failed to stat storage validation marker"
            );
            false
        }
    };

    if !visible {
        return Err(Error::StorageUnreachable {
            storage_path: layout.storage_path().to_string(),
            marker_path: marker,
        });
    }
    debug!(marker = %marker, "Storage validation marker found");
    Ok(())
}
