//! Rooted view over another filesystem
//!
//! Exposes a directory of an inner filesystem as the root of a new one. This is
//! the typical shape of a user supplied backend: a bucket or mount point the
//! caller pre-configured, addressed with bare paths such as `mock_bucket/exp`.

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;

use crate::backend::{join_path, relative_to, FileInfo, FileSystem, FileSystemHandle, FileSystemKind};

#[derive(Debug, Clone)]
pub struct SubTreeFileSystem {
    root: String,
    inner: FileSystemHandle,
}

impl SubTreeFileSystem {
    pub fn new(root: impl Into<String>, inner: FileSystemHandle) -> Self {
        Self {
            root: root.into(),
            inner,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn to_inner(&self, path: &str) -> String {
        join_path(&self.root, path)
    }

    fn from_inner(&self, mut info: FileInfo) -> FileInfo {
        if let Some(rel) = relative_to(&info.path, &self.root) {
            info.path = rel.to_string();
        }
        info
    }
}

#[async_trait]
impl FileSystem for SubTreeFileSystem {
    fn kind(&self) -> FileSystemKind {
        FileSystemKind::Custom
    }

    fn type_name(&self) -> &str {
        "subtree"
    }

    fn requires_serial_transfers(&self) -> bool {
        self.inner.requires_serial_transfers()
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let mut info = self.inner.stat(&self.to_inner(path)).await?;
        info.path = path.to_string();
        Ok(info)
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let entries = self.inner.list_dir(&self.to_inner(path)).await?;
        Ok(entries.into_iter().map(|e| self.from_inner(e)).collect())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.inner.create_dir(&self.to_inner(path)).await
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        self.inner.delete_dir(&self.to_inner(path)).await
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.inner.delete_file(&self.to_inner(path)).await
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        self.inner.read_file(&self.to_inner(path)).await
    }

    async fn write_file(&self, path: &str, data: Bytes) -> Result<u64> {
        self.inner.write_file(&self.to_inner(path), data).await
    }
}
