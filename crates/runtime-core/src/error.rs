//! Error types for the experiment storage core

use thiserror::Error;

/// Result type alias using the storage core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by the storage, layout, sync and persistence layers
#[derive(Error, Debug)]
pub enum Error {
    // Path errors
    #[error("Path not found: {path}")]
    NotFound { path: String },

    #[error(
        "Unable to set up cluster storage at storage_path={storage_path} \
         (validation marker {marker_path} is missing). Check that all nodes \
         in the cluster have read/write access to the configured storage path."
    )]
    StorageUnreachable {
        storage_path: String,
        marker_path: String,
    },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    // Transfer errors
    #[error("Transfer failed ({source_path} -> {destination}): {message}")]
    Transfer {
        source_path: String,
        destination: String,
        message: String,
    },

    #[error("Storage error: {message}")]
    Storage { message: String },

    // Sync engine errors
    #[error("Sync failed: {message}")]
    SyncFailed { message: String },

    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transfer { .. }
                | Error::Storage { .. }
                | Error::SyncFailed { .. }
                | Error::Timeout { .. }
                | Error::Io(_)
        )
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StorageUnreachable { .. }
                | Error::InvalidConfig { .. }
                | Error::InvalidState { .. }
                | Error::Internal { .. }
        )
    }

    /// Returns true for errors raised by misuse of the configuration or layout,
    /// as opposed to failures of the underlying storage
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Error::InvalidConfig { .. } | Error::InvalidState { .. })
    }

    /// Returns a retry delay hint in milliseconds, if applicable
    pub fn retry_delay_hint_ms(&self) -> Option<u64> {
        match self {
            Error::Transfer { .. } => Some(500),
            Error::Storage { .. } => Some(100),
            Error::SyncFailed { .. } => Some(1000),
            Error::Timeout { .. } => Some(1000),
            Error::Io(_) => Some(100),
            _ => None,
        }
    }

    /// Build a transfer error from any displayable cause
    pub fn transfer(
        source_path: impl Into<String>,
        destination: impl Into<String>,
        cause: impl std::fmt::Display,
    ) -> Self {
        Error::Transfer {
            source_path: source_path.into(),
            destination: destination.into(),
            message: cause.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let err = Error::transfer("/tmp/a", "bucket/a", "connection reset");
        assert!(err.is_retryable());

        let err = Error::InvalidConfig {
            message: "uri with explicit filesystem".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        let err = Error::StorageUnreachable {
            storage_path: "/mnt/nfs/results".to_string(),
            marker_path: "/mnt/nfs/results/exp/.validate_storage_marker".to_string(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_configuration_error());

        let err = Error::Timeout {
            operation: "wait_until_idle".to_string(),
            timeout_ms: 5000,
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_unreachable_message_names_storage_path() {
        let err = Error::StorageUnreachable {
            storage_path: "s3://bucket/results".to_string(),
            marker_path: "bucket/results/exp/.validate_storage_marker".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("storage_path=s3://bucket/results"));
        assert!(message.contains("read/write access"));
    }

    #[test]
    fn test_configuration_errors_have_no_retry_hint() {
        let err = Error::InvalidState {
            message: "trial_dir_name is not set".to_string(),
        };
        assert!(err.is_configuration_error());
        assert_eq!(err.retry_delay_hint_ms(), None);
    }
}
