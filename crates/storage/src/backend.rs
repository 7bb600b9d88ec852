//! Filesystem capability trait
//!
//! Defines the async interface every storage backend implements. Paths passed
//! to a backend are always *filesystem paths*: prefix-stripped, `/`-separated,
//! never URIs.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;

/// Shared handle to a backend, cloned freely between callers
pub type FileSystemHandle = Arc<dyn FileSystem>;

/// Broad family a backend belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileSystemKind {
    /// Local disk (or a network mount exposed as local disk)
    Local,

    /// Object store such as S3 or the in-memory store
    ObjectStore,

    /// User supplied backend
    Custom,
}

impl fmt::Display for FileSystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSystemKind::Local => write!(f, "local"),
            FileSystemKind::ObjectStore => write!(f, "object-store"),
            FileSystemKind::Custom => write!(f, "custom"),
        }
    }
}

/// Type of the entry found at a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    NotFound,
    File,
    Directory,
}

/// Result of a stat or list call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Filesystem path of the entry
    pub path: String,

    /// Entry type
    pub file_type: FileType,

    /// Size in bytes (files only)
    pub size: Option<u64>,
}

impl FileInfo {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            file_type: FileType::NotFound,
            size: None,
        }
    }

    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            file_type: FileType::File,
            size: Some(size),
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            file_type: FileType::Directory,
            size: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.file_type != FileType::NotFound
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Final path component
    pub fn base_name(&self) -> &str {
        base_name(&self.path)
    }
}

/// Async capability set shared by every storage backend
///
/// Implementors provide single-path primitives; recursive copy, upload and
/// download are built on top of them in [`crate::ops`].
#[async_trait]
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Backend family
    fn kind(&self) -> FileSystemKind;

    /// Short name used in logs (e.g. `local`, `s3`, `mem`)
    fn type_name(&self) -> &str;

    /// Whether concurrent transfers through this backend's client are unsafe.
    ///
    /// Copies touching such a backend are forced onto a single task.
    fn requires_serial_transfers(&self) -> bool {
        false
    }

    /// Stat one path. Missing paths yield `FileType::NotFound`, not an error.
    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// List the direct children of a directory.
    ///
    /// A missing path yields an empty listing.
    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>>;

    /// Create a directory and its parents. Idempotent.
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Recursively delete a directory
    async fn delete_dir(&self, path: &str) -> Result<()>;

    /// Delete a single file
    async fn delete_file(&self, path: &str) -> Result<()>;

    /// Read a whole file
    async fn read_file(&self, path: &str) -> Result<Bytes>;

    /// Write a whole file, creating parent directories as needed.
    ///
    /// Returns the number of bytes written.
    async fn write_file(&self, path: &str, data: Bytes) -> Result<u64>;
}

/// Join a filesystem path and a relative name with `/`
pub fn join_path(base: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        return name.to_string();
    }
    if name.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// Final component of a `/`-separated path
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Path of `path` relative to `base`, if `path` lies under it
pub fn relative_to<'a>(path: &'a str, base: &str) -> Option<&'a str> {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return Some(path.trim_start_matches('/'));
    }
    if path == base {
        return Some("");
    }
    path.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('/'))
}
