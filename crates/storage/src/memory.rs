//! In-memory object store backend
//!
//! Behaves like a flat key/value object store: keys are `/`-separated paths,
//! directories exist implicitly when any key lives under them, and explicit
//! directory markers are kept so empty directories survive. Resolved for the
//! `mem://` and `memory://` schemes.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use runtime_core::{Error, Result};
use tracing::{debug, instrument};

use crate::backend::{FileInfo, FileSystem, FileSystemKind};

#[derive(Debug, Clone)]
enum Entry {
    Directory,
    File(Bytes),
}

/// Thread-safe in-memory object store
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    objects: RwLock<BTreeMap<String, Entry>>,
}

static SHARED: OnceLock<Arc<MemoryFileSystem>> = OnceLock::new();

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance handed out when a `mem://` URI is resolved,
    /// so every layout in the process sees the same objects.
    pub fn shared() -> Arc<MemoryFileSystem> {
        SHARED.get_or_init(|| Arc::new(MemoryFileSystem::new())).clone()
    }

    /// Number of stored files
    pub fn file_count(&self) -> usize {
        self.objects
            .read()
            .values()
            .filter(|e| matches!(e, Entry::File(_)))
            .count()
    }

    fn key(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn child_prefix(key: &str) -> String {
        if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        }
    }

    fn ancestors(key: &str) -> impl Iterator<Item = &str> {
        key.match_indices('/').map(move |(idx, _)| &key[..idx])
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    fn kind(&self) -> FileSystemKind {
        FileSystemKind::ObjectStore
    }

    fn type_name(&self) -> &str {
        "mem"
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let key = Self::key(path);
        if key.is_empty() {
            return Ok(FileInfo::directory(path));
        }

        let objects = self.objects.read();
        match objects.get(&key) {
            Some(Entry::File(data)) => Ok(FileInfo::file(path, data.len() as u64)),
            Some(Entry::Directory) => Ok(FileInfo::directory(path)),
            None => {
                let prefix = Self::child_prefix(&key);
                let implicit_dir = objects
                    .range(prefix.clone()..)
                    .next()
                    .is_some_and(|(k, _)| k.starts_with(&prefix));
                if implicit_dir {
                    Ok(FileInfo::directory(path))
                } else {
                    Ok(FileInfo::not_found(path))
                }
            }
        }
    }

    #[instrument(skip(self), fields(backend = "mem"))]
    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let key = Self::key(path);
        let prefix = Self::child_prefix(&key);
        let objects = self.objects.read();

        if let Some(Entry::File(_)) = objects.get(&key) {
            return Err(Error::Storage {
                message: format!("Cannot list {}: not a directory", path),
            });
        }

        let mut children: BTreeMap<String, FileInfo> = BTreeMap::new();
        for (k, entry) in objects.range(prefix.clone()..) {
            let Some(rest) = k.strip_prefix(&prefix) else {
                break;
            };
            if rest.is_empty() {
                continue;
            }
            let (name, nested) = match rest.split_once('/') {
                Some((name, _)) => (name, true),
                None => (rest, false),
            };
            let child_key = format!("{}{}", prefix, name);
            let info = match (nested, entry) {
                (false, Entry::File(data)) => FileInfo::file(child_key.clone(), data.len() as u64),
                _ => FileInfo::directory(child_key.clone()),
            };
            children.entry(child_key).or_insert(info);
        }

        debug!(count = children.len(), "Listed directory");
        Ok(children.into_values().collect())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let key = Self::key(path);
        if key.is_empty() {
            return Ok(());
        }

        let mut objects = self.objects.write();
        for dir in Self::ancestors(&key).chain(std::iter::once(key.as_str())) {
            match objects.get(dir) {
                Some(Entry::File(_)) => {
                    return Err(Error::Storage {
                        message: format!("Cannot create directory {}: {} is a file", path, dir),
                    })
                }
                Some(Entry::Directory) => {}
                None => {
                    objects.insert(dir.to_string(), Entry::Directory);
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "mem"))]
    async fn delete_dir(&self, path: &str) -> Result<()> {
        let key = Self::key(path);
        let prefix = Self::child_prefix(&key);
        let mut objects = self.objects.write();

        let doomed: Vec<String> = objects
            .keys()
            .filter(|k| **k == key || k.starts_with(&prefix))
            .cloned()
            .collect();

        if doomed.is_empty() {
            return Err(Error::NotFound {
                path: path.to_string(),
            });
        }
        for k in &doomed {
            objects.remove(k);
        }
        debug!(removed = doomed.len(), "Deleted directory");
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let key = Self::key(path);
        let mut objects = self.objects.write();
        match objects.get(&key) {
            Some(Entry::File(_)) => {
                objects.remove(&key);
                Ok(())
            }
            _ => Err(Error::NotFound {
                path: path.to_string(),
            }),
        }
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        match self.objects.read().get(&Self::key(path)) {
            Some(Entry::File(data)) => Ok(data.clone()),
            _ => Err(Error::NotFound {
                path: path.to_string(),
            }),
        }
    }

    async fn write_file(&self, path: &str, data: Bytes) -> Result<u64> {
        let key = Self::key(path);
        let size = data.len() as u64;
        let mut objects = self.objects.write();
        if let Some(Entry::Directory) = objects.get(&key) {
            return Err(Error::Storage {
                message: format!("Cannot write {}: path is a directory", path),
            });
        }
        objects.insert(key, Entry::File(data));
        Ok(size)
    }
}
