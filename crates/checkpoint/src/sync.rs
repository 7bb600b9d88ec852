//! Background directory sync
//!
//! A [`SyncEngine`] mirrors one local directory to durable storage from a
//! single background task. Uploads never overlap: requests arriving while one
//! is running replace the pending target and are picked up once the running
//! upload finishes. A periodic cycle re-uploads whenever the local tree has
//! changed since the last successful mirror.
//!
//! ```text
//! Idle -> Syncing -> Idle
//! Idle -> Syncing -> Failed -> (next cycle) Syncing -> Idle
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use runtime_core::{Error, Result, SyncConfig};
use storage::{
    delete_path, download_with_options, upload, CopyStats, DownloadOptions, ExcludePatterns,
    FileSystemHandle,
};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::layout::StorageLayout;

/// Shutdown signal sender
pub type ShutdownSender = broadcast::Sender<()>;

/// Sync engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No upload running; the last cycle succeeded or had nothing to do
    Idle,

    /// An upload is running
    Syncing,

    /// The last cycle failed; the next cycle retries
    Failed,
}

/// Snapshot of the engine state
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub phase: SyncPhase,

    /// Highest request sequence number covered by a finished cycle
    pub completed_seq: u64,

    /// Number of successful uploads
    pub uploads: u64,

    /// Error of the most recent failed cycle
    pub last_error: Option<String>,

    /// Completion time of the last successful upload
    pub last_success: Option<DateTime<Utc>>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            completed_seq: 0,
            uploads: 0,
            last_error: None,
            last_success: None,
        }
    }
}

/// One unit of sync work, built and retried by external schedulers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    Upload {
        local_path: PathBuf,
        fs_path: String,
        exclude: Vec<String>,
    },
    Download {
        fs_path: String,
        local_path: PathBuf,
    },
    Delete {
        fs_path: String,
    },
}

impl SyncCommand {
    /// Run the command against `filesystem`.
    ///
    /// Deletes are best effort: failures are logged, never returned.
    pub async fn execute(&self, filesystem: &FileSystemHandle) -> Result<()> {
        match self {
            SyncCommand::Upload {
                local_path,
                fs_path,
                exclude,
            } => upload(local_path, filesystem, fs_path, exclude).await.map(|_| ()),
            SyncCommand::Download {
                fs_path,
                local_path,
            } => storage::download(filesystem, fs_path, local_path, true).await,
            SyncCommand::Delete { fs_path } => {
                delete_path(filesystem.as_ref(), fs_path).await;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct UploadTarget {
    local_path: PathBuf,
    fs_path: String,
    exclude: Vec<String>,
}

impl UploadTarget {
    fn same_location(&self, other: &UploadTarget) -> bool {
        self.local_path == other.local_path && self.fs_path == other.fs_path
    }
}

/// Pending work, read and cleared as one unit by the worker
#[derive(Debug, Default)]
struct Pending {
    /// Latest scheduled upload; later requests replace earlier ones
    target: Option<UploadTarget>,

    /// Upload on the next cycle even if nothing changed locally
    dirty: bool,
}

#[derive(Debug)]
struct Shared {
    filesystem: FileSystemHandle,
    config: SyncConfig,
    download_lock_timeout: Option<Duration>,

    pending: Mutex<Pending>,

    /// Bumped by every request that callers may wait on
    requested_seq: AtomicU64,

    wake: Notify,
    status: watch::Sender<SyncStatus>,
}

/// State owned by the background task
#[derive(Debug, Default)]
struct WorkerState {
    /// Upload abandoned after `sync_timeout`, still running
    abandoned: Option<JoinHandle<Result<CopyStats>>>,

    /// Target and start time of the last successful upload
    watermark: Option<(UploadTarget, SystemTime)>,
}

/// Single-flight background mirror of a local directory
#[derive(Debug)]
pub struct SyncEngine {
    shared: Arc<Shared>,
    shutdown_tx: ShutdownSender,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Start the engine's background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        filesystem: FileSystemHandle,
        config: SyncConfig,
        download_lock_timeout: Option<Duration>,
    ) -> Result<Self> {
        config.validate()?;
        ExcludePatterns::new(&config.exclude)?;

        let (status, _) = watch::channel(SyncStatus::default());
        let shared = Arc::new(Shared {
            filesystem,
            config,
            download_lock_timeout,
            pending: Mutex::new(Pending::default()),
            requested_seq: AtomicU64::new(0),
            wake: Notify::new(),
            status,
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(Self::run(Arc::clone(&shared), shutdown_rx));

        info!(
            backend = shared.filesystem.type_name(),
            period_ms = shared.config.sync_period.as_millis(),
            timeout_ms = shared.config.sync_timeout.as_millis(),
            "Sync engine started"
        );

        Ok(Self {
            shared,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Engine for a layout, or `None` when the local cache is the durable store
    pub fn for_layout(layout: &StorageLayout) -> Result<Option<Self>> {
        if !layout.syncing_needed() {
            debug!(layout = %layout, "Local cache is durable storage; no sync engine");
            return Ok(None);
        }
        Self::start(
            layout.filesystem().clone(),
            layout.sync_config().clone(),
            layout.config().download_lock_timeout,
        )
        .map(Some)
    }

    pub fn filesystem(&self) -> &FileSystemHandle {
        &self.shared.filesystem
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Current engine state
    pub fn status(&self) -> SyncStatus {
        self.shared.status.borrow().clone()
    }

    /// Mirror `local_path` to `fs_path`, in the background.
    ///
    /// `exclude` adds to the engine's configured patterns. The target stays
    /// registered: periodic cycles re-upload it whenever it changes.
    pub fn schedule_upload(
        &self,
        local_path: impl Into<PathBuf>,
        fs_path: impl Into<String>,
        exclude: &[String],
    ) -> Result<()> {
        let mut patterns = self.shared.config.exclude.clone();
        patterns.extend(exclude.iter().cloned());
        ExcludePatterns::new(&patterns)?;

        let target = UploadTarget {
            local_path: local_path.into(),
            fs_path: fs_path.into(),
            exclude: patterns,
        };
        debug!(
            local_path = %target.local_path.display(),
            fs_path = %target.fs_path,
            "Upload scheduled"
        );
        {
            let mut pending = self.shared.pending.lock();
            pending.target = Some(target);
            pending.dirty = true;
        }
        self.request_cycle();
        Ok(())
    }

    /// Run a cycle now, uploading even if nothing changed locally
    pub fn trigger_now(&self) {
        self.shared.pending.lock().dirty = true;
        self.request_cycle();
    }

    /// Must run after the pending state is updated so a cycle that observes
    /// the new sequence number also observes the new target.
    fn request_cycle(&self) {
        self.shared.requested_seq.fetch_add(1, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Wait until every request made so far has been handled.
    ///
    /// Fails with `Timeout` when `timeout` elapses first and with `SyncFailed`
    /// when the cycle that handled the last request failed.
    pub async fn wait_until_idle(&self, timeout: Duration) -> Result<()> {
        let target = self.shared.requested_seq.load(Ordering::SeqCst);
        let mut rx = self.shared.status.subscribe();

        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.completed_seq >= target && s.phase != SyncPhase::Syncing),
        )
        .await;

        let status = match waited {
            Err(_) => {
                return Err(Error::Timeout {
                    operation: "wait for sync engine to become idle".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(_)) => {
                return Err(Error::ChannelClosed {
                    channel: "sync status".to_string(),
                })
            }
            Ok(Ok(status)) => status.clone(),
        };

        match status.phase {
            SyncPhase::Failed => Err(Error::SyncFailed {
                message: status
                    .last_error
                    .unwrap_or_else(|| "unknown error".to_string()),
            }),
            _ => Ok(()),
        }
    }

    /// Download `fs_path` into `local_path` right away
    pub async fn download(&self, fs_path: &str, local_path: &Path) -> Result<()> {
        download_with_options(
            &self.shared.filesystem,
            fs_path,
            local_path,
            DownloadOptions {
                use_lock: true,
                lock_timeout: self.shared.download_lock_timeout,
            },
        )
        .await
    }

    /// Delete `fs_path` right away, best effort: failures are only logged
    pub async fn delete(&self, fs_path: &str) {
        delete_path(self.shared.filesystem.as_ref(), fs_path).await;
    }

    /// Stop the background task and wait for it to exit.
    ///
    /// An upload abandoned after its timeout keeps running detached.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Sync engine task failed");
            }
        }
    }

    async fn run(shared: Arc<Shared>, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = shared.config.sync_period;
        let mut state = WorkerState::default();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shared.wake.notified() => {}
                _ = shutdown_rx.recv() => {
                    info!("Sync engine stopping");
                    break;
                }
            }
            shared.run_cycle(&mut state).await;
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Shared {
    async fn run_cycle(&self, state: &mut WorkerState) {
        if state.abandoned.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("Previous upload still running after its timeout; deferring sync");
            return;
        }
        state.abandoned = None;

        let covered = self.requested_seq.load(Ordering::SeqCst);
        let (target, forced) = {
            let mut pending = self.pending.lock();
            (pending.target.clone(), std::mem::take(&mut pending.dirty))
        };
        let Some(target) = target else {
            self.finish_idle(covered);
            return;
        };

        if !forced {
            let since = state
                .watermark
                .as_ref()
                .filter(|(mirrored, _)| mirrored.same_location(&target))
                .map(|(_, started)| *started);
            let changed = match newest_modification(&target.local_path).await {
                Some(mtime) => since.map_or(true, |w| mtime > w),
                None => false,
            };
            if !changed {
                debug!(local_path = %target.local_path.display(), "Nothing new to sync");
                self.finish_idle(covered);
                return;
            }
        }

        self.status.send_modify(|s| s.phase = SyncPhase::Syncing);
        let started = SystemTime::now();

        let filesystem = Arc::clone(&self.filesystem);
        let upload_target = target.clone();
        let mut handle = tokio::spawn(async move {
            upload(
                &upload_target.local_path,
                &filesystem,
                &upload_target.fs_path,
                &upload_target.exclude,
            )
            .await
        });

        let timeout = self.config.sync_timeout;
        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::Internal {
                message: format!("upload task failed: {}", e),
            }),
            Err(_) => {
                state.abandoned = Some(handle);
                Err(Error::Timeout {
                    operation: format!("upload {}", target.local_path.display()),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        match outcome {
            Ok(stats) => {
                state.watermark = Some((target.clone(), started));
                info!(
                    local_path = %target.local_path.display(),
                    fs_path = %target.fs_path,
                    files = stats.files,
                    bytes = stats.bytes,
                    "Sync cycle complete"
                );
                self.status.send_modify(|s| {
                    s.phase = SyncPhase::Idle;
                    s.completed_seq = s.completed_seq.max(covered);
                    s.uploads += 1;
                    s.last_error = None;
                    s.last_success = Some(Utc::now());
                });
            }
            Err(e) => {
                // Retry on the next cycle whatever the local tree looks like
                self.pending.lock().dirty = true;
                error!(
                    local_path = %target.local_path.display(),
                    fs_path = %target.fs_path,
                    error = %e,
                    "Sync cycle failed"
                );
                self.status.send_modify(|s| {
                    s.phase = SyncPhase::Failed;
                    s.completed_seq = s.completed_seq.max(covered);
                    s.last_error = Some(e.to_string());
                });
            }
        }
    }

    fn finish_idle(&self, covered: u64) {
        self.status.send_modify(|s| {
            if s.phase != SyncPhase::Failed {
                s.phase = SyncPhase::Idle;
            }
            s.completed_seq = s.completed_seq.max(covered);
        });
    }
}

/// Latest modification time anywhere under `path`, `None` if it is missing
async fn newest_modification(path: &Path) -> Option<SystemTime> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        WalkDir::new(&path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.metadata().ok())
            .filter_map(|meta| meta.modified().ok())
            .max()
    })
    .await
    .ok()
    .flatten()
}
