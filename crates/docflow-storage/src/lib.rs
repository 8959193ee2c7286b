//! Docflow Storage Library
//!
//! Object storage partitioned into named areas. Every area is a separate
//! bucket (or directory, for the local backend) and a document keeps the same
//! key in all of them: which area holds the object is the only thing that
//! changes as the document moves through the pipeline.
//!
//! Moves between areas are always copy-then-delete so a crash mid-move leaves
//! the object in its source area.

pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
pub mod memory;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

// Re-export commonly used types
pub use docflow_core::StorageBackend;
pub use factory::create_storage;
#[cfg(feature = "storage-local")]
pub use local::LocalAreaStorage;
pub use memory::{MemoryStorage, StorageOp};
#[cfg(feature = "storage-s3")]
pub use s3::S3AreaStorage;
pub use traits::{AreaBuckets, AreaStorage, StorageArea, StorageError, StorageResult};
