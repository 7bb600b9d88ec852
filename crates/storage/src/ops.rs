//! Transfer operations over any pair of filesystems
//!
//! These are the only calls the layout, sync and persistence layers use to
//! touch storage. Loading-bearing operations (`copy_files`, `upload`,
//! `download`) propagate failures; convenience operations
//! (`create_directory`, `delete_path`) log and swallow them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use runtime_core::{Error, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::backend::{base_name, join_path, FileSystem, FileSystemHandle};
use crate::excluding::{ExcludePatterns, ExcludingFileSystem};
use crate::lock::DestinationLock;
use crate::LocalFileSystem;

/// Default number of files transferred concurrently
pub const DEFAULT_COPY_CONCURRENCY: usize = 8;

/// Options for a recursive copy
#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    /// Transfer files concurrently (ignored when a backend requires serial transfers)
    pub use_threads: bool,

    /// Upper bound on concurrent file transfers
    pub max_concurrency: usize,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            use_threads: true,
            max_concurrency: DEFAULT_COPY_CONCURRENCY,
        }
    }
}

/// Summary of a completed copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

/// Options for [`download_with_options`]
#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    /// Hold an advisory lock on the destination for the whole transfer
    pub use_lock: bool,

    /// Give up waiting for the lock after this long (`None` waits forever)
    pub lock_timeout: Option<Duration>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            use_lock: true,
            lock_timeout: None,
        }
    }
}

/// Whether `path` exists on `fs`
pub async fn exists(fs: &dyn FileSystem, path: &str) -> Result<bool> {
    Ok(fs.stat(path).await?.exists())
}

/// Whether `path` is a directory; fails with `NotFound` when it is missing
pub async fn is_directory(fs: &dyn FileSystem, path: &str) -> Result<bool> {
    let info = fs.stat(path).await?;
    if !info.exists() {
        return Err(Error::NotFound {
            path: path.to_string(),
        });
    }
    Ok(info.is_dir())
}

/// Names of the direct children of `path`, like `ls`; empty when missing
pub async fn list_at(fs: &dyn FileSystem, path: &str) -> Result<Vec<String>> {
    Ok(fs
        .list_dir(path)
        .await?
        .iter()
        .map(|info| base_name(&info.path).to_string())
        .collect())
}

/// Create a directory, logging instead of failing.
///
/// Some backends require containers (buckets, mount points) that only an
/// operator can create; the following write reports the real problem.
pub async fn create_directory(fs: &dyn FileSystem, path: &str) {
    if let Err(e) = fs.create_dir(path).await {
        warn!(
            backend = fs.type_name(),
            path = %path,
            error = %e,
            "Caught error when creating directory"
        );
    }
}

/// Recursively delete a directory, logging instead of failing
pub async fn delete_path(fs: &dyn FileSystem, path: &str) {
    match fs.delete_dir(path).await {
        Ok(()) => {}
        Err(Error::NotFound { .. }) => debug!(path = %path, "Nothing to delete"),
        Err(e) => warn!(
            backend = fs.type_name(),
            path = %path,
            error = %e,
            "Caught error when deleting path"
        ),
    }
}

/// Recursively copy a file or directory between two filesystems.
///
/// A directory source has its *contents* copied into `dst_path`; a file source
/// is written to `dst_path` as a file.
#[instrument(
    skip(src, dst, options),
    fields(src_backend = src.type_name(), dst_backend = dst.type_name())
)]
pub async fn copy_files(
    src: &FileSystemHandle,
    src_path: &str,
    dst: &FileSystemHandle,
    dst_path: &str,
    options: CopyOptions,
) -> Result<CopyStats> {
    let started = Instant::now();
    let serial = src.requires_serial_transfers() || dst.requires_serial_transfers();
    let use_threads = options.use_threads && !serial && options.max_concurrency > 1;

    let info = src.stat(src_path).await?;
    if !info.exists() {
        return Err(Error::NotFound {
            path: src_path.to_string(),
        });
    }

    let mut stats = CopyStats::default();

    if info.is_file() {
        stats.bytes = copy_one(src, src_path, dst, dst_path).await?;
        stats.files = 1;
        return Ok(stats);
    }

    dst.create_dir(dst_path)
        .await
        .map_err(|e| Error::transfer(src_path, dst_path, e))?;

    // Walk the source, mirroring directories eagerly so empty ones survive
    let mut files = Vec::new();
    let mut stack = vec![(src_path.to_string(), dst_path.to_string())];
    while let Some((src_dir, dst_dir)) = stack.pop() {
        for entry in src.list_dir(&src_dir).await? {
            let target = join_path(&dst_dir, entry.base_name());
            if entry.is_dir() {
                dst.create_dir(&target)
                    .await
                    .map_err(|e| Error::transfer(&entry.path, &target, e))?;
                stats.directories += 1;
                stack.push((entry.path, target));
            } else if entry.is_file() {
                files.push((entry.path, target));
            }
        }
    }

    stats.files = files.len();
    stats.bytes = if use_threads {
        copy_concurrently(src, dst, files, options.max_concurrency).await?
    } else {
        let mut bytes = 0;
        for (from, to) in files {
            bytes += copy_one(src, &from, dst, &to).await?;
        }
        bytes
    };

    debug!(
        files = stats.files,
        directories = stats.directories,
        bytes = stats.bytes,
        serial = !use_threads,
        elapsed_ms = started.elapsed().as_millis(),
        "Copy complete"
    );
    Ok(stats)
}

async fn copy_one(
    src: &FileSystemHandle,
    from: &str,
    dst: &FileSystemHandle,
    to: &str,
) -> Result<u64> {
    let data = src
        .read_file(from)
        .await
        .map_err(|e| Error::transfer(from, to, e))?;
    dst.write_file(to, data)
        .await
        .map_err(|e| Error::transfer(from, to, e))
}

async fn copy_concurrently(
    src: &FileSystemHandle,
    dst: &FileSystemHandle,
    files: Vec<(String, String)>,
    max_concurrency: usize,
) -> Result<u64> {
    let permits = Arc::new(Semaphore::new(max_concurrency));
    let mut tasks = JoinSet::new();

    for (from, to) in files {
        let src = Arc::clone(src);
        let dst = Arc::clone(dst);
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|e| Error::Internal {
                message: format!("copy semaphore closed: {}", e),
            })?;
            copy_one(&src, &from, &dst, &to).await
        });
    }

    let mut bytes = 0;
    while let Some(joined) = tasks.join_next().await {
        let copied = joined.map_err(|e| Error::Internal {
            message: format!("copy task failed: {}", e),
        })?;
        match copied {
            Ok(n) => bytes += n,
            Err(e) => {
                tasks.abort_all();
                return Err(e);
            }
        }
    }
    Ok(bytes)
}

/// Download `(fs, fs_path)` to a local path, holding the destination lock
pub async fn download(
    fs: &FileSystemHandle,
    fs_path: &str,
    local_path: &Path,
    use_lock: bool,
) -> Result<()> {
    download_with_options(
        fs,
        fs_path,
        local_path,
        DownloadOptions {
            use_lock,
            ..Default::default()
        },
    )
    .await
}

/// Download a directory or file to a local path.
///
/// Directory contents land directly inside `local_path`. Parent directories of
/// `local_path` are created first and kept even on failure. When the transfer
/// fails and `local_path` did not exist before the call, whatever was written
/// there is removed; a pre-existing destination is left as it is.
pub async fn download_with_options(
    fs: &FileSystemHandle,
    fs_path: &str,
    local_path: &Path,
    options: DownloadOptions,
) -> Result<()> {
    let local_path = absolute(local_path);
    let existed_before = tokio::fs::metadata(&local_path).await.is_ok();

    if is_directory(fs.as_ref(), fs_path).await? {
        tokio::fs::create_dir_all(&local_path).await?;
    } else if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let result = transfer_to_local(fs, fs_path, &local_path, options).await;

    if let Err(e) = &result {
        if !existed_before {
            remove_local(&local_path).await;
        }
        warn!(
            backend = fs.type_name(),
            fs_path = %fs_path,
            local_path = %local_path.display(),
            error = %e,
            rolled_back = !existed_before,
            "Download failed"
        );
    }
    result
}

async fn transfer_to_local(
    fs: &FileSystemHandle,
    fs_path: &str,
    local_path: &Path,
    options: DownloadOptions,
) -> Result<()> {
    let _lock = if options.use_lock {
        Some(DestinationLock::acquire(local_path, options.lock_timeout).await?)
    } else {
        None
    };

    let local: FileSystemHandle = Arc::new(LocalFileSystem::new());
    let stats = copy_files(
        fs,
        fs_path,
        &local,
        &local_path.to_string_lossy(),
        CopyOptions::default(),
    )
    .await?;
    debug!(files = stats.files, bytes = stats.bytes, "Downloaded");
    Ok(())
}

async fn remove_local(path: &Path) {
    let removed = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => Ok(()),
    };
    if let Err(e) = removed {
        warn!(path = %path.display(), error = %e, "Failed to clean up partial download");
    }
}

/// Upload a local directory or file to `(fs, fs_path)`.
///
/// A directory has its contents copied into `fs_path`, which is created
/// first. Entries matching any `exclude` pattern are dropped from the source
/// listing, whole subtrees included. A single file is written to `fs_path`
/// itself, unless its name matches an exclude pattern.
pub async fn upload(
    local_path: &Path,
    fs: &FileSystemHandle,
    fs_path: &str,
    exclude: &[String],
) -> Result<CopyStats> {
    let exclude = ExcludePatterns::new(exclude)?;
    let local_path = absolute(local_path);
    let local_str = local_path.to_string_lossy().to_string();

    let metadata = match tokio::fs::metadata(&local_path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound { path: local_str })
        }
        Err(e) => return Err(Error::Io(e)),
    };

    let local: FileSystemHandle = Arc::new(LocalFileSystem::new());

    if metadata.is_file() {
        let name = base_name(&local_str);
        if exclude.matches(name, false) || exclude.matches(&local_str, false) {
            debug!(path = %local_str, "Single-file upload excluded by pattern");
            return Ok(CopyStats::default());
        }
        if let Some((parent, _)) = fs_path.rsplit_once('/').filter(|(p, _)| !p.is_empty()) {
            create_directory(fs.as_ref(), parent).await;
        }
        return copy_files(&local, &local_str, fs, fs_path, CopyOptions::default()).await;
    }

    create_directory(fs.as_ref(), fs_path).await;

    let source: FileSystemHandle = if exclude.is_empty() {
        local
    } else {
        Arc::new(ExcludingFileSystem::new(local, local_str.clone(), exclude))
    };

    let stats = copy_files(&source, &local_str, fs, fs_path, CopyOptions::default()).await?;
    info!(
        local_path = %local_str,
        backend = fs.type_name(),
        fs_path = %fs_path,
        files = stats.files,
        bytes = stats.bytes,
        "Uploaded"
    );
    Ok(stats)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
