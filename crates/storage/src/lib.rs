//! Storage - Filesystem abstraction for experiment results and checkpoints
//!
//! Provides a single async capability set over:
//! - Local filesystem (default feature)
//! - In-memory object store (`mem://`)
//! - Amazon S3 / S3-compatible storage (with `s3` feature)
//! - Any user supplied [`FileSystem`] implementation
//!
//! plus the transfer operations built on it: recursive copy, upload with
//! exclusion patterns, and download with a per-destination lock.
//!
//! # Example
//!
//! ```no_run
//! use storage::{resolve_filesystem, upload};
//! use std::path::Path;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let resolved = resolve_filesystem("mem://bucket/exp", None).await?;
//! upload(
//!     Path::new("/tmp/trial"),
//!     &resolved.filesystem,
//!     &resolved.fs_path,
//!     &["*.png".to_string()],
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod excluding;
mod local;
mod lock;
mod memory;
pub mod ops;
mod resolve;
mod subtree;

#[cfg(feature = "s3")]
mod s3;

pub use backend::{
    base_name, join_path, relative_to, FileInfo, FileSystem, FileSystemHandle, FileSystemKind,
    FileType,
};
pub use excluding::{ExcludePatterns, ExcludingFileSystem};
pub use local::LocalFileSystem;
pub use lock::{lock_path_for, DestinationLock};
pub use memory::MemoryFileSystem;
pub use ops::{
    copy_files, create_directory, delete_path, download, download_with_options, exists,
    is_directory, list_at, upload, CopyOptions, CopyStats, DownloadOptions,
};
pub use resolve::{is_uri, parse_uri, resolve_filesystem, ParsedUri, ResolvedStorage, StoragePrefix};
pub use subtree::SubTreeFileSystem;

#[cfg(feature = "s3")]
pub use s3::{S3Config, S3FileSystem};
