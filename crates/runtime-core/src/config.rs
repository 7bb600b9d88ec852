//! Storage configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Environment variable overriding the local cache root
pub const LOCAL_CACHE_DIR_ENV: &str = "STRATA_LOCAL_CACHE_DIR";

/// Environment variable disabling the dated experiment directory suffix
pub const DISABLE_DATED_SUBDIR_ENV: &str = "STRATA_DISABLE_DATED_SUBDIR";

/// Directory name used under `$HOME` when no cache root is configured
pub const DEFAULT_LOCAL_CACHE_DIR_NAME: &str = "strata_results";

/// Storage configuration threaded into layout construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local cache root where results are written before syncing
    pub local_cache_dir: PathBuf,

    /// Use the bare run identifier as experiment directory name
    pub disable_dated_subdir: bool,

    /// Background sync settings
    pub sync: SyncConfig,

    /// How long a download waits for the destination lock (`None` waits forever)
    #[serde(default, with = "humantime_serde::option")]
    pub download_lock_timeout: Option<Duration>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_cache_dir: default_local_cache_dir(),
            disable_dated_subdir: false,
            sync: SyncConfig::default(),
            download_lock_timeout: None,
        }
    }
}

impl StorageConfig {
    /// Build the configuration from the process environment.
    ///
    /// Reads `STRATA_LOCAL_CACHE_DIR` and `STRATA_DISABLE_DATED_SUBDIR` once;
    /// the result is then passed explicitly to whatever needs it.
    pub fn from_env() -> Self {
        let local_cache_dir = std::env::var_os(LOCAL_CACHE_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_local_cache_dir);

        let disable_dated_subdir = std::env::var(DISABLE_DATED_SUBDIR_ENV)
            .map(|v| v.trim() == "1")
            .unwrap_or(false);

        debug!(
            local_cache_dir = %local_cache_dir.display(),
            disable_dated_subdir,
            "Storage configuration loaded from environment"
        );
        Self {
            local_cache_dir,
            disable_dated_subdir,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the local cache root
    pub fn with_local_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_cache_dir = dir.into();
        self
    }

    /// Replace the sync settings
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Validate all nested settings
    pub fn validate(&self) -> Result<()> {
        if self.local_cache_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig {
                message: "local_cache_dir must not be empty".to_string(),
            });
        }
        self.sync.validate()
    }
}

fn default_local_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(DEFAULT_LOCAL_CACHE_DIR_NAME)
}

/// Background sync configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How often the background cycle fires
    #[serde(with = "humantime_serde")]
    pub sync_period: Duration,

    /// How long a single cycle may run before it is abandoned
    #[serde(with = "humantime_serde")]
    pub sync_timeout: Duration,

    /// Glob patterns removed from every upload's source listing
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_period: Duration::from_secs(300),
            sync_timeout: Duration::from_secs(1800),
            exclude: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sync_period.is_zero() {
            return Err(Error::InvalidConfig {
                message: "sync_period must be greater than zero".to_string(),
            });
        }
        if self.sync_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                message: "sync_timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
