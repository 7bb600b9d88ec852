//! Runtime Core - Foundation for the experiment storage core
//!
//! Provides the shared error type, storage/sync configuration and the
//! tracing bootstrap used by the `storage` and `checkpoint` crates.

pub mod config;
pub mod error;
pub mod telemetry;

pub use config::{StorageConfig, SyncConfig};
pub use error::{Error, Result};
pub use telemetry::init_tracing;
