//! Advisory file lock serializing downloads to the same destination
//!
//! Lock files live under the system temp directory, named after the
//! normalized destination path, so the destination's parent is never polluted
//! and every process on the machine agrees on the lock location.

use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use runtime_core::{Error, Result};
use tracing::{debug, warn};

/// Directory (under the temp dir) holding download locks
const LOCK_DIR_NAME: &str = "strata_locks";

/// Poll interval while waiting for a contended lock
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Held exclusive lock; released on drop
#[derive(Debug)]
pub struct DestinationLock {
    file: File,
    path: PathBuf,
}

impl DestinationLock {
    /// Acquire the lock for `destination`, waiting at most `timeout`
    /// (`None` waits indefinitely).
    pub async fn acquire(destination: &Path, timeout: Option<Duration>) -> Result<Self> {
        let path = lock_path_for(destination);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?
            .into_std()
            .await;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(lock = %path.display(), waited_ms = started.elapsed().as_millis(), "Acquired download lock");
                    return Ok(Self { file, path });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if let Some(timeout) = timeout {
                        if started.elapsed() >= timeout {
                            return Err(Error::Timeout {
                                operation: format!("acquire lock {}", path.display()),
                                timeout_ms: timeout.as_millis() as u64,
                            });
                        }
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release download lock");
        }
    }
}

/// Lock file location for a destination path
pub fn lock_path_for(destination: &Path) -> PathBuf {
    let absolute = if destination.is_absolute() {
        destination.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(destination))
            .unwrap_or_else(|_| destination.to_path_buf())
    };

    let mut parts: Vec<String> = Vec::new();
    for component in absolute.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::Prefix(prefix) => {
                parts.push(prefix.as_os_str().to_string_lossy().replace(':', ""))
            }
            Component::RootDir | Component::CurDir => {}
        }
    }

    std::env::temp_dir()
        .join(LOCK_DIR_NAME)
        .join(format!("{}.lock", parts.join("_")))
}
