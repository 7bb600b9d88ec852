//! S3 filesystem backend
//!
//! Provides S3-compatible storage addressed by filesystem paths of the form
//! `bucket/key/...` with:
//! - Directory markers (`key/` objects) so empty directories survive
//! - Multipart uploads for large files
//! - Exponential backoff retry logic
//! - Custom endpoint support (for MinIO, LocalStack, etc.)

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{http::HttpResponse, Builder as S3ConfigBuilder},
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::Bytes;
use runtime_core::{Error, Result};
use tracing::{debug, instrument, warn};

use crate::backend::{FileInfo, FileSystem, FileSystemKind};

/// Threshold for switching to multipart upload (5 MB)
const MULTIPART_THRESHOLD: usize = 5 * 1024 * 1024;

/// Part size for multipart uploads (5 MB minimum required by S3)
const MULTIPART_PART_SIZE: usize = 5 * 1024 * 1024;

/// Maximum retry attempts for transient failures
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds)
const BASE_RETRY_DELAY_MS: u64 = 100;

/// S3-compatible filesystem
///
/// The first path segment names the bucket; the rest is the object key.
#[derive(Debug, Clone)]
pub struct S3FileSystem {
    client: Client,
}

/// Configuration for S3FileSystem
#[derive(Debug, Clone)]
pub struct S3Config {
    /// AWS region (default: "us-east-1")
    pub region: Option<String>,
    /// Optional custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style addressing (required for MinIO)
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: Some("us-east-1".to_string()),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

/// Split a filesystem path into bucket and key
fn split_path(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_matches('/');
    let (bucket, key) = trimmed.split_once('/').unwrap_or((trimmed, ""));
    if bucket.is_empty() {
        return Err(Error::InvalidConfig {
            message: format!("S3 path {:?} does not name a bucket", path),
        });
    }
    Ok((bucket, key))
}

/// Listing prefix for the children of `key`
/// Whether a failed request means the key does not exist.
///
/// HEAD responses carry no body, so the modeled error may be absent and only
/// the status code tells.
fn is_missing<E>(err: &SdkError<E, HttpResponse>, modeled: impl FnOnce(&E) -> bool) -> bool {
    err.as_service_error().is_some_and(modeled)
        || err
            .raw_response()
            .is_some_and(|response| response.status().as_u16() == 404)
}

fn dir_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{}/", key)
    }
}

impl S3FileSystem {
    /// Create an S3FileSystem with default AWS configuration
    ///
    /// Uses environment variables or instance profile for credentials.
    pub async fn new() -> Self {
        Self::with_config(S3Config::default()).await
    }

    /// Create an S3FileSystem with custom configuration
    pub async fn with_config(config: S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(
                config.region.unwrap_or_else(|| "us-east-1".to_string()),
            ))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(endpoint) = &config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(s3_config_builder.build()),
        }
    }

    /// Execute an async operation with exponential backoff retry
    async fn with_retry<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }

                    let delay = Duration::from_millis(BASE_RETRY_DELAY_MS * (1 << attempt));
                    warn!(
                        %operation,
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Retrying after transient error"
                    );

                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Storage {
            message: format!("{} failed after {} retries", operation, MAX_RETRIES),
        }))
    }

    /// Object keys and common prefixes directly under `prefix`
    async fn list_level(
        &self,
        bucket: &str,
        prefix: &str,
        delimited: bool,
    ) -> Result<(Vec<(String, u64)>, Vec<String>)> {
        let mut objects = Vec::new();
        let mut prefixes = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
            if delimited {
                request = request.delimiter("/");
            }
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| Error::Storage {
                message: format!("S3 list_objects failed: {}", e),
            })?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    let size = object.size().unwrap_or_default().max(0) as u64;
                    objects.push((key.to_string(), size));
                }
            }
            for common in response.common_prefixes() {
                if let Some(p) = common.prefix() {
                    prefixes.push(p.to_string());
                }
            }

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        Ok((objects, prefixes))
    }

    /// Perform multipart upload for large files
    async fn multipart_upload(&self, bucket: &str, key: &str, data: Bytes) -> Result<u64> {
        let size = data.len() as u64;

        let create_result = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to initiate multipart upload: {}", e),
            })?;

        let upload_id = create_result.upload_id().ok_or_else(|| Error::Storage {
            message: "No upload_id returned".to_string(),
        })?;

        debug!(key, upload_id, size, "Started multipart upload");

        let mut completed_parts = Vec::new();
        let mut offset = 0;
        let mut part_number = 1;

        while offset < data.len() {
            let end = std::cmp::min(offset + MULTIPART_PART_SIZE, data.len());
            let part_data = data.slice(offset..end);

            let upload_part_result = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part_data))
                .send()
                .await
                .map_err(|e| {
                    self.abort_multipart_upload(bucket, key, upload_id);
                    Error::Storage {
                        message: format!("Failed to upload part {}: {}", part_number, e),
                    }
                })?;

            let etag = upload_part_result.e_tag().map(String::from);
            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(etag)
                    .build(),
            );

            debug!(part_number, offset, end, "Uploaded part");
            offset = end;
            part_number += 1;
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to complete multipart upload: {}", e),
            })?;

        debug!(key, size, "Completed multipart upload");
        Ok(size)
    }

    /// Abort a multipart upload (best effort, for cleanup)
    fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) {
        let client = self.client.clone();
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();

        tokio::spawn(async move {
            let _ = client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await;
        });
    }

    async fn delete_key(&self, bucket: &str, key: &str) -> Result<()> {
        self.with_retry("delete", || async {
            self.client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Error::Storage {
                    message: format!("S3 delete_object failed: {}", e),
                })?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl FileSystem for S3FileSystem {
    fn kind(&self) -> FileSystemKind {
        FileSystemKind::ObjectStore
    }

    fn type_name(&self) -> &str {
        "s3"
    }

    /// The SDK client is shared by every transfer on this handle; keep one
    /// request in flight.
    fn requires_serial_transfers(&self) -> bool {
        true
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let (bucket, key) = split_path(path)?;
        if key.is_empty() {
            return Ok(FileInfo::directory(path));
        }

        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(head) => {
                let size = head.content_length().unwrap_or_default().max(0) as u64;
                return Ok(FileInfo::file(path, size));
            }
            Err(e) if is_missing(&e, |se| se.is_not_found()) => {}
            Err(e) => {
                return Err(Error::Storage {
                    message: format!("S3 head_object failed: {}", DisplayErrorContext(&e)),
                });
            }
        }

        let response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(dir_prefix(key))
            .max_keys(1)
            .send()
            .await
            .map_err(|e| Error::Storage {
                message: format!("S3 list_objects failed: {}", e),
            })?;

        if response.contents().is_empty() {
            Ok(FileInfo::not_found(path))
        } else {
            Ok(FileInfo::directory(path))
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let (bucket, key) = split_path(path)?;
        let prefix = dir_prefix(key);
        let (objects, prefixes) = self.list_level(bucket, &prefix, true).await?;

        let mut results = Vec::new();
        for (object_key, size) in objects {
            // The directory's own marker
            if object_key == prefix {
                continue;
            }
            results.push(FileInfo::file(format!("{}/{}", bucket, object_key), size));
        }
        for common in prefixes {
            let child = common.trim_end_matches('/');
            results.push(FileInfo::directory(format!("{}/{}", bucket, child)));
        }

        results.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(count = results.len(), "Listed directory");
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn create_dir(&self, path: &str) -> Result<()> {
        let (bucket, key) = split_path(path)?;
        if key.is_empty() {
            // Buckets are provisioned out of band
            return Ok(());
        }
        let marker = dir_prefix(key);

        self.with_retry("create_dir", || async {
            self.client
                .put_object()
                .bucket(bucket)
                .key(&marker)
                .body(ByteStream::from(Bytes::new()))
                .send()
                .await
                .map_err(|e| Error::Storage {
                    message: format!("S3 put_object failed: {}", e),
                })?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete_dir(&self, path: &str) -> Result<()> {
        let (bucket, key) = split_path(path)?;
        let (objects, _) = self.list_level(bucket, &dir_prefix(key), false).await?;
        if objects.is_empty() {
            return Err(Error::NotFound {
                path: path.to_string(),
            });
        }

        for (object_key, _) in &objects {
            self.delete_key(bucket, object_key).await?;
        }
        debug!(removed = objects.len(), "Deleted directory");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete_file(&self, path: &str) -> Result<()> {
        let (bucket, key) = split_path(path)?;
        self.delete_key(bucket, key).await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn read_file(&self, path: &str) -> Result<Bytes> {
        let (bucket, key) = split_path(path)?;

        self.with_retry("read", || async {
            let result = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    if is_missing(&e, |se| se.is_no_such_key()) {
                        Error::NotFound {
                            path: path.to_string(),
                        }
                    } else {
                        Error::Storage {
                            message: format!("S3 get_object failed: {}", DisplayErrorContext(&e)),
                        }
                    }
                })?;

            let bytes = result.body.collect().await.map_err(|e| Error::Storage {
                message: format!("Failed to read S3 response body: {}", e),
            })?;

            Ok(bytes.into_bytes())
        })
        .await
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn write_file(&self, path: &str, data: Bytes) -> Result<u64> {
        let (bucket, key) = split_path(path)?;
        let size = data.len();

        if size > MULTIPART_THRESHOLD {
            return self.multipart_upload(bucket, key, data).await;
        }

        self.with_retry("write", || {
            let data = data.clone();
            async move {
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .body(ByteStream::from(data))
                    .send()
                    .await
                    .map_err(|e| Error::Storage {
                        message: format!("S3 put_object failed: {}", e),
                    })?;

                Ok(size as u64)
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("bucket/exp/t1").unwrap(), ("bucket", "exp/t1"));
        assert_eq!(split_path("/bucket/exp/").unwrap(), ("bucket", "exp"));
        assert_eq!(split_path("bucket").unwrap(), ("bucket", ""));
        assert!(matches!(split_path("/"), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_dir_prefix() {
        assert_eq!(dir_prefix("exp/t1"), "exp/t1/");
        assert_eq!(dir_prefix(""), "");
    }

    #[test]
    fn test_s3_config_default() {
        let config = S3Config::default();
        assert!(config.endpoint_url.is_none());
        assert_eq!(config.region, Some("us-east-1".to_string()));
        assert!(!config.force_path_style);
    }

    fn response(status: u16) -> HttpResponse {
        HttpResponse::new(status.try_into().unwrap(), "".into())
    }

    #[test]
    fn test_missing_key_detection() {
        use aws_sdk_s3::operation::get_object::GetObjectError;
        use aws_sdk_s3::operation::head_object::HeadObjectError;
        use aws_sdk_s3::types::error::{InvalidObjectState, NoSuchKey, NotFound};

        let head: SdkError<HeadObjectError, HttpResponse> = SdkError::service_error(
            HeadObjectError::NotFound(NotFound::builder().build()),
            response(404),
        );
        assert!(is_missing(&head, |se| se.is_not_found()));

        let get: SdkError<GetObjectError, HttpResponse> = SdkError::service_error(
            GetObjectError::NoSuchKey(NoSuchKey::builder().build()),
            response(404),
        );
        assert!(is_missing(&get, |se| se.is_no_such_key()));

        // Status alone is enough when the body did not decode to the modeled error
        let bare_404: SdkError<GetObjectError, HttpResponse> = SdkError::service_error(
            GetObjectError::InvalidObjectState(InvalidObjectState::builder().build()),
            response(404),
        );
        assert!(is_missing(&bare_404, |se| se.is_no_such_key()));

        let denied: SdkError<GetObjectError, HttpResponse> = SdkError::service_error(
            GetObjectError::InvalidObjectState(InvalidObjectState::builder().build()),
            response(403),
        );
        assert!(!is_missing(&denied, |se| se.is_no_such_key()));

        let offline: SdkError<HeadObjectError, HttpResponse> =
            SdkError::construction_failure("no endpoint");
        assert!(!is_missing(&offline, |se| se.is_not_found()));
    }

    #[tokio::test]
    async fn test_client_requires_serial_transfers() {
        let fs = S3FileSystem::with_config(S3Config {
            endpoint_url: Some("http://localhost:9000".to_string()),
            force_path_style: true,
            ..Default::default()
        })
        .await;
        assert!(fs.requires_serial_transfers());
        assert_eq!(fs.kind(), FileSystemKind::ObjectStore);
    }
}
