//! Local filesystem backend
//!
//! Provides async file I/O with atomic writes to prevent partial/corrupt files.
//! Paths are plain OS paths; relative paths resolve against the process
//! working directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::backend::{FileInfo, FileSystem, FileSystemKind};

/// Local filesystem backend
///
/// - Atomic writes (write to .tmp, then rename)
/// - Automatic parent directory creation
/// - Non-recursive listing tolerant of missing directories
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }

    /// Generate a unique temporary file path next to `full_path`
    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    fn kind(&self) -> FileSystemKind {
        FileSystemKind::Local
    }

    fn type_name(&self) -> &str {
        "local"
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn stat(&self, path: &str) -> Result<FileInfo> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(FileInfo::directory(path)),
            Ok(meta) => Ok(FileInfo::file(path, meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(FileInfo::not_found(path)),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to stat {}: {}", path, e),
            }),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let mut entries = match fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Storage {
                    message: format!("Failed to list {}: {}", path, e),
                })
            }
        };

        let mut results = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let entry_path = path_string(&entry.path());
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // Entry vanished between readdir and stat
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };

            if metadata.is_dir() {
                results.push(FileInfo::directory(entry_path));
            } else {
                results.push(FileInfo::file(entry_path, metadata.len()));
            }
        }

        results.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(count = results.len(), "Listed directory");
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn create_dir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(path).await.map_err(|e| Error::Storage {
            message: format!("Failed to create directory {}: {}", path, e),
        })
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete_dir(&self, path: &str) -> Result<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to delete directory {}: {}", path, e),
            }),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete_file(&self, path: &str) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to delete {}: {}", path, e),
            }),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn read_file(&self, path: &str) -> Result<Bytes> {
        match fs::read(path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to read {}: {}", path, e),
            }),
        }
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write_file(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = PathBuf::from(path);
        let temp_path = Self::temp_path(&full_path);
        let size = data.len() as u64;

        if let Some(parent) = full_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage {
                    message: format!("Failed to create directory {:?}: {}", parent, e),
                })?;
        }

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to create temp file {:?}: {}", temp_path, e),
            })?;

        file.write_all(&data).await.map_err(|e| Error::Storage {
            message: format!("Failed to write data: {}", e),
        })?;

        file.sync_all().await.map_err(|e| Error::Storage {
            message: format!("Failed to sync file: {}", e),
        })?;

        fs::rename(&temp_path, &full_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to rename {:?} to {:?}: {}", temp_path, full_path, e),
            })?;

        debug!(?full_path, size, "File written");
        Ok(size)
    }
}
