//! Experiment storage for distributed training
//!
//! Provides the experiment/trial/checkpoint path layout, the storage
//! reachability gate, background directory sync and checkpoint persistence on
//! top of the `storage` filesystem abstraction.

pub mod handle;
pub mod layout;
pub mod persist;
pub mod sync;
pub mod validation;

pub use handle::Checkpoint;
pub use layout::{
    checkpoint_dir_name, experiment_dir_name, parse_checkpoint_index, StorageLayout,
    StorageLayoutBuilder,
};
pub use persist::persist_current_checkpoint;
pub use sync::{SyncCommand, SyncEngine, SyncPhase, SyncStatus};
pub use validation::VALIDATION_MARKER;
