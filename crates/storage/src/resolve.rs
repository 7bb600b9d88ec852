//! Storage path resolution
//!
//! Turns a user supplied storage path (a bare path or a
//! `scheme://authority/path?query` URI) into a filesystem handle plus a
//! prefix-stripped filesystem path. The stripped scheme and query are kept as
//! a [`StoragePrefix`] so URIs of the user's format can be rebuilt.

use std::fmt;
use std::sync::Arc;

use runtime_core::{Error, Result};
use tracing::debug;
use percent_encoding::percent_decode_str;
use url::{Position, Url};

use crate::backend::FileSystemHandle;
use crate::{LocalFileSystem, MemoryFileSystem};

/// Part of a storage URI removed during resolution
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoragePrefix {
    scheme: Option<String>,
    query: Option<String>,
}

impl StoragePrefix {
    /// Prefix of a bare path: rebuilding yields the path unchanged
    pub fn none() -> Self {
        Self::default()
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Rebuild a URI for a filesystem path in the original format.
    ///
    /// `s3://.?region=x` joined with `bucket/exp` gives `s3://bucket/exp?region=x`.
    pub fn uri_for(&self, fs_path: &str) -> String {
        let Some(scheme) = &self.scheme else {
            return fs_path.to_string();
        };
        let mut uri = format!("{}://{}", scheme, fs_path);
        if let Some(query) = &self.query {
            uri.push('?');
            uri.push_str(query);
        }
        uri
    }
}

impl fmt::Display for StoragePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scheme {
            None => write!(f, "."),
            Some(scheme) => {
                write!(f, "{}://.", scheme)?;
                if let Some(query) = &self.query {
                    write!(f, "?{}", query)?;
                }
                Ok(())
            }
        }
    }
}

/// Outcome of resolving a storage path
#[derive(Debug, Clone)]
pub struct ResolvedStorage {
    /// Backend able to reach `fs_path`
    pub filesystem: FileSystemHandle,

    /// Prefix-stripped path on `filesystem`
    pub fs_path: String,

    /// Stripped scheme/query
    pub prefix: StoragePrefix,
}

/// Parsed, not yet resolved, storage URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri {
    pub scheme: String,
    pub fs_path: String,
    pub prefix: StoragePrefix,
}

/// Whether `path` carries a URI scheme
pub fn is_uri(path: &str) -> bool {
    match path.split_once("://") {
        Some((scheme, _)) => {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// Split a URI into scheme, prefix-stripped path and prefix.
///
/// Object-store style URIs keep their full authority (userinfo and port
/// included) as the first path segment (`s3://bucket/p` → `bucket/p`);
/// `file://` URIs keep only the path. Percent escapes are decoded so the
/// filesystem sees the path the user wrote, and the query is kept verbatim.
pub fn parse_uri(uri: &str) -> Result<ParsedUri> {
    let url = Url::parse(uri).map_err(|e| Error::InvalidConfig {
        message: format!("Invalid storage URI {:?}: {}", uri, e),
    })?;
    let scheme = url.scheme().to_string();

    let fs_path = if scheme == "file" {
        match url.to_file_path() {
            Ok(path) => path.to_string_lossy().to_string(),
            Err(()) => decode(url.path())?,
        }
    } else {
        let authority = decode(&url[Position::BeforeUsername..Position::AfterPort])?;
        let rest = decode(url.path().trim_start_matches('/'))?;
        match (authority.is_empty(), rest.is_empty()) {
            (true, _) => rest,
            (false, true) => authority,
            (false, false) => format!("{}/{}", authority, rest),
        }
    };
    let fs_path = if fs_path.len() > 1 {
        fs_path.trim_end_matches('/').to_string()
    } else {
        fs_path
    };

    Ok(ParsedUri {
        prefix: StoragePrefix {
            scheme: Some(scheme.clone()),
            query: raw_query(uri),
        },
        scheme,
        fs_path,
    })
}

fn decode(component: &str) -> Result<String> {
    percent_decode_str(component)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| Error::InvalidConfig {
            message: format!("Storage URI component {:?} is not valid UTF-8: {}", component, e),
        })
}

/// Query exactly as the user wrote it, so rebuilt URIs match byte for byte
fn raw_query(uri: &str) -> Option<String> {
    let without_fragment = uri.split_once('#').map_or(uri, |(head, _)| head);
    without_fragment
        .split_once('?')
        .map(|(_, query)| query.to_string())
}

/// Resolve a storage path and an optional explicit filesystem.
///
/// * URI + no filesystem: the backend is chosen from the scheme.
/// * bare path + filesystem: the path is used as-is on that filesystem.
/// * bare path + no filesystem: the local filesystem.
/// * URI + filesystem: ambiguous, rejected as a configuration error.
pub async fn resolve_filesystem(
    storage_path: &str,
    filesystem: Option<FileSystemHandle>,
) -> Result<ResolvedStorage> {
    if let Some(filesystem) = filesystem {
        if is_uri(storage_path) {
            return Err(Error::InvalidConfig {
                message: format!(
                    "If you specify a custom storage filesystem, the storage path must be \
                     a path on that filesystem, not a URI. For example \
                     (filesystem=CustomS3, storage_path='s3://bucket/path') should be \
                     (filesystem=CustomS3, storage_path='bucket/path'). \
                     Got (filesystem={}, storage_path={})",
                    filesystem.type_name(),
                    storage_path
                ),
            });
        }
        return Ok(ResolvedStorage {
            filesystem,
            fs_path: storage_path.to_string(),
            prefix: StoragePrefix::none(),
        });
    }

    if !is_uri(storage_path) {
        return Ok(ResolvedStorage {
            filesystem: Arc::new(LocalFileSystem::new()),
            fs_path: storage_path.to_string(),
            prefix: StoragePrefix::none(),
        });
    }

    let parsed = parse_uri(storage_path)?;
    let filesystem = filesystem_for_scheme(&parsed).await?;
    debug!(
        scheme = %parsed.scheme,
        fs_path = %parsed.fs_path,
        prefix = %parsed.prefix,
        "Resolved storage URI"
    );
    Ok(ResolvedStorage {
        filesystem,
        fs_path: parsed.fs_path,
        prefix: parsed.prefix,
    })
}

async fn filesystem_for_scheme(parsed: &ParsedUri) -> Result<FileSystemHandle> {
    match parsed.scheme.as_str() {
        "file" => Ok(Arc::new(LocalFileSystem::new())),
        "mem" | "memory" => Ok(MemoryFileSystem::shared()),
        #[cfg(feature = "s3")]
        "s3" => {
            let region = parsed
                .prefix
                .query()
                .and_then(|q| query_param(q, "region"))
                .map(str::to_string);
            let endpoint_url = parsed
                .prefix
                .query()
                .and_then(|q| query_param(q, "endpoint_override"))
                .map(str::to_string);
            let storage = crate::S3FileSystem::with_config(crate::S3Config {
                region,
                force_path_style: endpoint_url.is_some(),
                endpoint_url,
            })
            .await;
            Ok(Arc::new(storage))
        }
        other => Err(Error::InvalidConfig {
            message: format!(
                "No filesystem available for URI scheme {:?}; pass a bare path together \
                 with an explicit filesystem instead",
                other
            ),
        }),
    }
}

#[cfg_attr(not(feature = "s3"), allow(dead_code))]
fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}
