//! Checkpoint handle
//!
//! A checkpoint is only a location: a filesystem plus a directory path on it.
//! Content is opaque here; serializing model state is the caller's business.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use runtime_core::Result;
use storage::{download, FileSystemHandle, LocalFileSystem};

/// A checkpoint directory on some filesystem
#[derive(Debug, Clone)]
pub struct Checkpoint {
    filesystem: FileSystemHandle,
    path: String,
}

impl Checkpoint {
    pub fn new(filesystem: FileSystemHandle, path: impl Into<String>) -> Self {
        Self {
            filesystem,
            path: path.into(),
        }
    }

    /// Checkpoint for a directory on the local disk
    pub fn from_directory(path: impl AsRef<Path>) -> Self {
        Self::new(
            Arc::new(LocalFileSystem::new()),
            path.as_ref().to_string_lossy().to_string(),
        )
    }

    pub fn filesystem(&self) -> &FileSystemHandle {
        &self.filesystem
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Download the checkpoint contents into a local directory.
    ///
    /// Concurrent downloads to the same directory are serialized.
    pub async fn to_directory(&self, local_dir: impl AsRef<Path>) -> Result<()> {
        download(&self.filesystem, &self.path, local_dir.as_ref(), true).await
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Checkpoint(filesystem={}, path={})",
            self.filesystem.type_name(),
            self.path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_checkpoint_to_directory() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir_all(source.join("nested")).unwrap();
        std::fs::write(source.join("model.bin"), b"weights").unwrap();
        std::fs::write(source.join("nested/optimizer.bin"), b"state").unwrap();

        let checkpoint = Checkpoint::from_directory(&source);
        assert_eq!(checkpoint.filesystem().type_name(), "local");

        let restored = dir.path().join("restored");
        checkpoint.to_directory(&restored).await.unwrap();
        assert_eq!(std::fs::read(restored.join("model.bin")).unwrap(), b"weights");
        assert_eq!(
            std::fs::read(restored.join("nested/optimizer.bin")).unwrap(),
            b"state"
        );
    }

    #[test]
    fn test_display() {
        let checkpoint = Checkpoint::from_directory("/tmp/ckpt");
        assert_eq!(checkpoint.to_string(), "Checkpoint(filesystem=local, path=/tmp/ckpt)");
    }
}
