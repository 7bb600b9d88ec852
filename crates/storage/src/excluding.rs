//! Exclusion-filtering decorator
//!
//! Wraps any filesystem and hides listing entries matching shell-glob
//! patterns. Uploads wrap their *source* in this view, so excluded files and
//! whole excluded directories never reach the copy, whatever the destination
//! backend is.

use async_trait::async_trait;
use bytes::Bytes;
use glob::{MatchOptions, Pattern};
use runtime_core::{Error, Result};
use tracing::trace;

use crate::backend::{relative_to, FileInfo, FileSystem, FileSystemHandle, FileSystemKind};

/// `*` crosses `/`, matching is case sensitive, leading dots are not special
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Ordered list of compiled exclude patterns
#[derive(Debug, Clone, Default)]
pub struct ExcludePatterns {
    patterns: Vec<Pattern>,
}

impl ExcludePatterns {
    /// Compile patterns, rejecting malformed globs as configuration errors
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Pattern::new(p).map_err(|e| Error::InvalidConfig {
                    message: format!("Invalid exclude pattern {:?}: {}", p, e),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Test one candidate path. Directories are also tested with a trailing
    /// separator so `logs/*` excludes the `logs` directory itself.
    pub fn matches(&self, candidate: &str, is_dir: bool) -> bool {
        let with_separator = is_dir.then(|| format!("{}/", candidate.trim_end_matches('/')));
        self.patterns.iter().any(|pattern| {
            pattern.matches_with(candidate, MATCH_OPTIONS)
                || with_separator
                    .as_deref()
                    .is_some_and(|alt| pattern.matches_with(alt, MATCH_OPTIONS))
        })
    }
}

/// Filesystem view hiding entries that match the exclude patterns
#[derive(Debug, Clone)]
pub struct ExcludingFileSystem {
    inner: FileSystemHandle,
    root: String,
    exclude: ExcludePatterns,
}

impl ExcludingFileSystem {
    /// `root` is the upload source; candidates are matched both relative to it
    /// and by their full path.
    pub fn new(inner: FileSystemHandle, root: impl Into<String>, exclude: ExcludePatterns) -> Self {
        Self {
            inner,
            root: root.into(),
            exclude,
        }
    }

    fn should_exclude(&self, info: &FileInfo) -> bool {
        let is_dir = info.is_dir();
        let relative_match = relative_to(&info.path, &self.root)
            .filter(|rel| !rel.is_empty())
            .is_some_and(|rel| self.exclude.matches(rel, is_dir));
        relative_match || self.exclude.matches(&info.path, is_dir)
    }
}

#[async_trait]
impl FileSystem for ExcludingFileSystem {
    fn kind(&self) -> FileSystemKind {
        self.inner.kind()
    }

    fn type_name(&self) -> &str {
        "excluding"
    }

    fn requires_serial_transfers(&self) -> bool {
        self.inner.requires_serial_transfers()
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        self.inner.stat(path).await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let entries = self.inner.list_dir(path).await?;
        Ok(entries
            .into_iter()
            .filter(|info| {
                let excluded = self.should_exclude(info);
                if excluded {
                    trace!(path = %info.path, "Excluded from upload");
                }
                !excluded
            })
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.inner.create_dir(path).await
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        self.inner.delete_dir(path).await
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.inner.delete_file(path).await
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        self.inner.read_file(path).await
    }

    async fn write_file(&self, path: &str, data: Bytes) -> Result<u64> {
        self.inner.write_file(path, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryFileSystem;
    use std::sync::Arc;

    #[test]
    fn test_directory_matches_with_trailing_separator() {
        let exclude = ExcludePatterns::new(["logs/*"]).unwrap();
        assert!(exclude.matches("logs", true));
        assert!(!exclude.matches("logs", false));
        assert!(exclude.matches("logs/run.txt", false));
    }

    #[test]
    fn test_star_crosses_separators() {
        let exclude = ExcludePatterns::new(["*.png"]).unwrap();
        assert!(exclude.matches("plots/deep/loss.png", false));
        assert!(!exclude.matches("plots/deep/loss.csv", false));
    }

    #[test]
    fn test_character_classes() {
        let exclude = ExcludePatterns::new(["checkpoint_00000[0-2]"]).unwrap();
        assert!(exclude.matches("checkpoint_000001", true));
        assert!(!exclude.matches("checkpoint_000003", true));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let result = ExcludePatterns::new(["[unclosed"]);
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_listing_is_filtered() {
        let inner = Arc::new(MemoryFileSystem::new());
        inner.write_file("src/keep.txt", Bytes::from("k")).await.unwrap();
        inner.write_file("src/drop.png", Bytes::from("d")).await.unwrap();
        inner.write_file("src/logs/a.log", Bytes::from("l")).await.unwrap();

        let fs = ExcludingFileSystem::new(
            inner,
            "src",
            ExcludePatterns::new(["*.png", "logs/*"]).unwrap(),
        );
        let entries = fs.list_dir("src").await.unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["src/keep.txt"]);
    }
}
