//! Experiment / trial / checkpoint path layout
//!
//! A [`StorageLayout`] maps an experiment, an optional trial and the current
//! checkpoint index to concrete locations on both the local cache and the
//! durable filesystem. It is built once on the driver with
//! [`StorageLayoutBuilder::create`] and rebuilt on every worker with
//! [`StorageLayoutBuilder::open`] from the same inputs.
//!
//! ```text
//! <storage_path>/<experiment>/<trial>/checkpoint_000003
//! <local_cache>/<experiment>/<trial>/checkpoint_000003
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;
use runtime_core::{Error, Result, StorageConfig, SyncConfig};
use storage::{join_path, resolve_filesystem, FileSystemHandle, StoragePrefix};
use tracing::{debug, info};

use crate::validation;

/// Prefix of every checkpoint directory name
pub const CHECKPOINT_DIR_PREFIX: &str = "checkpoint_";

/// Zero padding width of the checkpoint index
pub const CHECKPOINT_INDEX_WIDTH: usize = 6;

/// Directory name for a checkpoint index: `checkpoint_000003`
pub fn checkpoint_dir_name(index: u64) -> String {
    format!(
        "{}{:0width$}",
        CHECKPOINT_DIR_PREFIX,
        index,
        width = CHECKPOINT_INDEX_WIDTH
    )
}

/// Index encoded in a checkpoint directory name, `None` for anything else
pub fn parse_checkpoint_index(name: &str) -> Option<u64> {
    let name = name.trim_end_matches('/');
    if !name.starts_with(CHECKPOINT_DIR_PREFIX) {
        return None;
    }
    let (_, digits) = name.rsplit_once('_')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Experiment directory name for a run: the identifier, optionally suffixed
/// with the local start time (`run_2026-10-19_14-03-59`).
pub fn experiment_dir_name(run_identifier: &str, dated: bool) -> String {
    if dated {
        format!("{}_{}", run_identifier, Local::now().format("%Y-%m-%d_%H-%M-%S"))
    } else {
        run_identifier.to_string()
    }
}

/// Resolved storage locations for one experiment (and optionally one trial)
#[derive(Debug)]
pub struct StorageLayout {
    /// Storage path as supplied by the user (URI or bare path)
    storage_path: String,

    /// Backend able to reach `storage_fs_path`
    filesystem: FileSystemHandle,

    /// Durable root, prefix-stripped
    storage_fs_path: String,

    /// Scheme/query stripped from `storage_path`
    prefix: StoragePrefix,

    /// Whether the caller supplied the backend explicitly
    custom_filesystem: bool,

    local_cache_path: PathBuf,
    experiment_dir_name: String,
    trial_dir_name: Option<String>,
    current_checkpoint_index: u64,

    /// Highest checkpoint index this instance has persisted
    last_persisted_index: Mutex<Option<u64>>,

    config: StorageConfig,
}

/// Builder for [`StorageLayout`]
#[derive(Debug)]
pub struct StorageLayoutBuilder {
    experiment_dir_name: String,
    storage_path: Option<String>,
    filesystem: Option<FileSystemHandle>,
    trial_dir_name: Option<String>,
    checkpoint_index: u64,
    config: StorageConfig,
}

impl StorageLayoutBuilder {
    /// Durable root: a URI (`s3://bucket/results`, `mem://b/p`) or a bare path.
    ///
    /// Without one, the local cache root is the durable store.
    pub fn storage_path(mut self, storage_path: impl Into<String>) -> Self {
        self.storage_path = Some(storage_path.into());
        self
    }

    /// Explicit backend; the storage path must then be a bare path on it
    pub fn filesystem(mut self, filesystem: FileSystemHandle) -> Self {
        self.filesystem = Some(filesystem);
        self
    }

    pub fn trial_dir_name(mut self, trial_dir_name: impl Into<String>) -> Self {
        self.trial_dir_name = Some(trial_dir_name.into());
        self
    }

    pub fn checkpoint_index(mut self, index: u64) -> Self {
        self.checkpoint_index = index;
        self
    }

    pub fn config(mut self, config: StorageConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the authoritative layout and publish the validation marker.
    ///
    /// Called once, by the process owning the experiment.
    pub async fn create(self) -> Result<StorageLayout> {
        let layout = self.build().await?;
        validation::establish(&layout).await?;
        validation::check(&layout).await?;
        info!(layout = %layout, "Storage layout created");
        Ok(layout)
    }

    /// Rebuild a layout from the same inputs without touching storage.
    ///
    /// Callers run [`validation::check`] before their first remote write.
    pub async fn open(self) -> Result<StorageLayout> {
        let layout = self.build().await?;
        debug!(layout = %layout, "Storage layout opened");
        Ok(layout)
    }

    async fn build(self) -> Result<StorageLayout> {
        self.config.validate()?;
        validate_dir_name("experiment", &self.experiment_dir_name)?;
        if let Some(trial) = &self.trial_dir_name {
            validate_dir_name("trial", trial)?;
        }

        let custom_filesystem = self.filesystem.is_some();
        let storage_path = match self.storage_path {
            Some(path) => path,
            None if custom_filesystem => {
                return Err(Error::InvalidConfig {
                    message: "An explicit filesystem requires a storage path on it".to_string(),
                })
            }
            None => self.config.local_cache_dir.to_string_lossy().to_string(),
        };

        let resolved = resolve_filesystem(&storage_path, self.filesystem).await?;

        Ok(StorageLayout {
            storage_path,
            filesystem: resolved.filesystem,
            storage_fs_path: resolved.fs_path,
            prefix: resolved.prefix,
            custom_filesystem,
            local_cache_path: self.config.local_cache_dir.clone(),
            experiment_dir_name: self.experiment_dir_name,
            trial_dir_name: self.trial_dir_name,
            current_checkpoint_index: self.checkpoint_index,
            last_persisted_index: Mutex::new(None),
            config: self.config,
        })
    }
}

fn validate_dir_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::InvalidConfig {
            message: format!("Invalid {} directory name {:?}", what, name),
        });
    }
    Ok(())
}

impl StorageLayout {
    /// Start building a layout for an experiment directory
    pub fn builder(experiment_dir_name: impl Into<String>) -> StorageLayoutBuilder {
        StorageLayoutBuilder {
            experiment_dir_name: experiment_dir_name.into(),
            storage_path: None,
            filesystem: None,
            trial_dir_name: None,
            checkpoint_index: 0,
            config: StorageConfig::default(),
        }
    }

    /// Start building a layout for a run, naming the experiment directory
    /// per `config.disable_dated_subdir`
    pub fn for_run(run_identifier: &str, config: StorageConfig) -> StorageLayoutBuilder {
        let name = experiment_dir_name(run_identifier, !config.disable_dated_subdir);
        Self::builder(name).config(config)
    }

    pub fn storage_path(&self) -> &str {
        &self.storage_path
    }

    pub fn filesystem(&self) -> &FileSystemHandle {
        &self.filesystem
    }

    pub fn storage_fs_path(&self) -> &str {
        &self.storage_fs_path
    }

    pub fn storage_prefix(&self) -> &StoragePrefix {
        &self.prefix
    }

    pub fn local_cache_path(&self) -> &Path {
        &self.local_cache_path
    }

    pub fn experiment_dir_name(&self) -> &str {
        &self.experiment_dir_name
    }

    pub fn trial_dir_name(&self) -> Option<&str> {
        self.trial_dir_name.as_deref()
    }

    pub fn current_checkpoint_index(&self) -> u64 {
        self.current_checkpoint_index
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.config.sync
    }

    pub fn is_custom_filesystem(&self) -> bool {
        self.custom_filesystem
    }

    /// Whether local results must be mirrored to durable storage.
    ///
    /// False only when the durable store *is* the local cache: no explicit
    /// backend was given and both roots name the same directory.
    pub fn syncing_needed(&self) -> bool {
        if self.custom_filesystem {
            return true;
        }
        if self.prefix.scheme().is_some_and(|s| s != "file") {
            return true;
        }
        normalize(Path::new(&self.storage_fs_path)) != normalize(&self.local_cache_path)
    }

    /// Set the trial once it is known
    pub fn set_trial_dir_name(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if let Some(existing) = &self.trial_dir_name {
            return Err(Error::InvalidState {
                message: format!(
                    "trial_dir_name is already set to {:?}; refusing to change it to {:?}",
                    existing, name
                ),
            });
        }
        validate_dir_name("trial", &name)?;
        self.trial_dir_name = Some(name);
        Ok(())
    }

    /// Move to a checkpoint index; indices never go backwards
    pub fn set_checkpoint_index(&mut self, index: u64) -> Result<()> {
        if index < self.current_checkpoint_index {
            return Err(Error::InvalidState {
                message: format!(
                    "checkpoint index cannot move backwards ({} -> {})",
                    self.current_checkpoint_index, index
                ),
            });
        }
        self.current_checkpoint_index = index;
        Ok(())
    }

    /// Advance to the next checkpoint index and return it
    pub fn increment_checkpoint_index(&mut self) -> u64 {
        self.current_checkpoint_index += 1;
        self.current_checkpoint_index
    }

    /// Record that the current index was persisted; rejects reuse
    pub(crate) fn claim_checkpoint_index(&self) -> Result<u64> {
        let index = self.current_checkpoint_index;
        let mut last = self.last_persisted_index.lock();
        if last.is_some_and(|persisted| index <= persisted) {
            return Err(Error::InvalidState {
                message: format!(
                    "checkpoint index {} was already persisted by this layout",
                    index
                ),
            });
        }
        *last = Some(index);
        Ok(index)
    }

    /// Whether the current index is free to persist
    pub(crate) fn ensure_checkpoint_index_unused(&self) -> Result<()> {
        let index = self.current_checkpoint_index;
        match *self.last_persisted_index.lock() {
            Some(persisted) if index <= persisted => Err(Error::InvalidState {
                message: format!(
                    "checkpoint index {} was already persisted by this layout",
                    index
                ),
            }),
            _ => Ok(()),
        }
    }

    fn require_trial(&self) -> Result<&str> {
        self.trial_dir_name.as_deref().ok_or_else(|| Error::InvalidState {
            message: "trial_dir_name must be set before accessing trial or checkpoint paths"
                .to_string(),
        })
    }

    /// Name of the current checkpoint directory
    pub fn checkpoint_dir_name(&self) -> String {
        checkpoint_dir_name(self.current_checkpoint_index)
    }

    // Durable paths

    pub fn experiment_fs_path(&self) -> String {
        join_path(&self.storage_fs_path, &self.experiment_dir_name)
    }

    pub fn trial_fs_path(&self) -> Result<String> {
        Ok(join_path(&self.experiment_fs_path(), self.require_trial()?))
    }

    pub fn checkpoint_fs_path(&self) -> Result<String> {
        Ok(join_path(&self.trial_fs_path()?, &self.checkpoint_dir_name()))
    }

    // URIs in the user's format

    pub fn experiment_uri(&self) -> String {
        self.prefix.uri_for(&self.experiment_fs_path())
    }

    pub fn trial_uri(&self) -> Result<String> {
        Ok(self.prefix.uri_for(&self.trial_fs_path()?))
    }

    pub fn checkpoint_uri(&self) -> Result<String> {
        Ok(self.prefix.uri_for(&self.checkpoint_fs_path()?))
    }

    // Local cache paths

    pub fn experiment_local_path(&self) -> PathBuf {
        self.local_cache_path.join(&self.experiment_dir_name)
    }

    pub fn trial_local_path(&self) -> Result<PathBuf> {
        Ok(self.experiment_local_path().join(self.require_trial()?))
    }

    pub fn checkpoint_local_path(&self) -> Result<PathBuf> {
        Ok(self.trial_local_path()?.join(self.checkpoint_dir_name()))
    }
}

impl fmt::Display for StorageLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StorageLayout(storage_path={}, local_cache_path={}, filesystem={}, \
             storage_fs_path={}, prefix={}, experiment={}, trial={}, checkpoint_index={})",
            self.storage_path,
            self.local_cache_path.display(),
            self.filesystem.type_name(),
            self.storage_fs_path,
            self.prefix,
            self.experiment_dir_name,
            self.trial_dir_name.as_deref().unwrap_or("<unset>"),
            self.current_checkpoint_index,
        )
    }
}

/// Lexical normalization: drops `.`, resolves `..`, ignores trailing separators
fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use storage::MemoryFileSystem;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> StorageConfig {
        StorageConfig::default().with_local_cache_dir(dir.path().join("cache"))
    }

    #[test]
    fn test_checkpoint_dir_name_round_trips() {
        for index in [0, 3, 42, 999_999, 1_234_567] {
            let name = checkpoint_dir_name(index);
            assert_eq!(parse_checkpoint_index(&name), Some(index));
        }
        assert_eq!(checkpoint_dir_name(3), "checkpoint_000003");
    }

    #[test]
    fn test_parse_checkpoint_index_rejects_other_names() {
        assert_eq!(parse_checkpoint_index("result.json"), None);
        assert_eq!(parse_checkpoint_index("checkpoint_"), None);
        assert_eq!(parse_checkpoint_index("checkpoint_tmp"), None);
        assert_eq!(parse_checkpoint_index("checkpoint_000007/"), Some(7));
    }

    #[test]
    fn test_experiment_dir_name() {
        assert_eq!(experiment_dir_name("run", false), "run");
        let dated = experiment_dir_name("run", true);
        assert!(dated.starts_with("run_"));
        // run_YYYY-MM-DD_HH-MM-SS
        assert_eq!(dated.len(), "run_".len() + 19);
    }

    #[tokio::test]
    async fn test_for_run_honors_dated_subdir_setting() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.disable_dated_subdir = true;
        let layout = StorageLayout::for_run("run", config).open().await.unwrap();
        assert_eq!(layout.experiment_dir_name(), "run");

        let layout = StorageLayout::for_run("run", config_in(&dir))
            .open()
            .await
            .unwrap();
        assert!(layout.experiment_dir_name().starts_with("run_"));
    }

    #[tokio::test]
    async fn test_memory_uri_layout() {
        let dir = TempDir::new().unwrap();
        let mut layout = StorageLayout::builder("exp")
            .storage_path("mem://layout-test/exp-root")
            .config(config_in(&dir))
            .open()
            .await
            .unwrap();

        assert_eq!(layout.experiment_fs_path(), "layout-test/exp-root/exp");
        assert!(layout.syncing_needed());

        layout.set_trial_dir_name("t1").unwrap();
        layout.set_checkpoint_index(3).unwrap();
        assert_eq!(
            layout.checkpoint_fs_path().unwrap(),
            "layout-test/exp-root/exp/t1/checkpoint_000003"
        );
        assert_eq!(
            layout.checkpoint_uri().unwrap(),
            "mem://layout-test/exp-root/exp/t1/checkpoint_000003"
        );
        assert_eq!(
            layout.checkpoint_local_path().unwrap(),
            dir.path().join("cache/exp/t1/checkpoint_000003")
        );
    }

    #[tokio::test]
    async fn test_trial_paths_require_trial_name() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::builder("exp")
            .config(config_in(&dir))
            .open()
            .await
            .unwrap();

        assert!(matches!(layout.trial_fs_path(), Err(Error::InvalidState { .. })));
        assert!(matches!(layout.checkpoint_local_path(), Err(Error::InvalidState { .. })));
        assert!(matches!(layout.checkpoint_uri(), Err(Error::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_trial_name_is_set_once() {
        let dir = TempDir::new().unwrap();
        let mut layout = StorageLayout::builder("exp")
            .config(config_in(&dir))
            .open()
            .await
            .unwrap();

        layout.set_trial_dir_name("t1").unwrap();
        let result = layout.set_trial_dir_name("t2");
        assert!(matches!(result, Err(Error::InvalidState { .. })));
        assert_eq!(layout.trial_dir_name(), Some("t1"));
    }

    #[tokio::test]
    async fn test_checkpoint_index_never_moves_backwards() {
        let dir = TempDir::new().unwrap();
        let mut layout = StorageLayout::builder("exp")
            .trial_dir_name("t1")
            .checkpoint_index(5)
            .config(config_in(&dir))
            .open()
            .await
            .unwrap();

        assert!(layout.set_checkpoint_index(4).is_err());
        assert_eq!(layout.increment_checkpoint_index(), 6);
        assert_eq!(layout.checkpoint_dir_name(), "checkpoint_000006");
    }

    #[tokio::test]
    async fn test_local_cache_as_storage_needs_no_sync() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::builder("exp")
            .config(config_in(&dir))
            .open()
            .await
            .unwrap();
        assert!(!layout.syncing_needed());
        assert_eq!(layout.storage_prefix().to_string(), ".");

        let spelled_differently = format!("{}/./", dir.path().join("cache").display());
        let layout = StorageLayout::builder("exp")
            .storage_path(spelled_differently)
            .config(config_in(&dir))
            .open()
            .await
            .unwrap();
        assert!(!layout.syncing_needed());
    }

    #[tokio::test]
    async fn test_explicit_filesystem_always_syncs() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("cache").to_string_lossy().to_string();
        let layout = StorageLayout::builder("exp")
            .storage_path(cache)
            .filesystem(Arc::new(MemoryFileSystem::new()))
            .config(config_in(&dir))
            .open()
            .await
            .unwrap();
        assert!(layout.is_custom_filesystem());
        assert!(layout.syncing_needed());
    }

    #[tokio::test]
    async fn test_uri_with_explicit_filesystem_is_rejected() {
        let dir = TempDir::new().unwrap();
        let result = StorageLayout::builder("exp")
            .storage_path("s3://bucket/p")
            .filesystem(Arc::new(MemoryFileSystem::new()))
            .config(config_in(&dir))
            .open()
            .await;
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_invalid_trial_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut layout = StorageLayout::builder("exp")
            .config(config_in(&dir))
            .open()
            .await
            .unwrap();
        assert!(matches!(
            layout.set_trial_dir_name("a/b"),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_claim_rejects_reused_index() {
        let dir = TempDir::new().unwrap();
        let mut layout = StorageLayout::builder("exp")
            .trial_dir_name("t1")
            .config(config_in(&dir))
            .open()
            .await
            .unwrap();

        assert_eq!(layout.claim_checkpoint_index().unwrap(), 0);
        assert!(layout.ensure_checkpoint_index_unused().is_err());
        assert!(layout.claim_checkpoint_index().is_err());

        layout.increment_checkpoint_index();
        assert!(layout.ensure_checkpoint_index_unused().is_ok());
        assert_eq!(layout.claim_checkpoint_index().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_display_mentions_paths() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::builder("exp")
            .storage_path("mem://display/root")
            .config(config_in(&dir))
            .open()
            .await
            .unwrap();
        let text = layout.to_string();
        assert!(text.contains("storage_path=mem://display/root"));
        assert!(text.contains("trial=<unset>"));
        assert!(text.contains("filesystem=mem"));
    }
}
