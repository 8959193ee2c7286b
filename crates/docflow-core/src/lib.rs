//! Docflow Core Library
//!
//! Domain models, configuration, error taxonomy and metadata helpers shared by
//! every docflow component (ingestor, job queue, worker and storage client).

pub mod config;
pub mod error;
pub mod job_error;
pub mod metadata;
pub mod models;

pub use config::{
    parse_bool, ClamAvConfig, DatabaseConfig, KafkaConfig, LogFormat, PipelineConfig,
    ProcessingConfig, QueueConfig, S3Config, ScannerPreference, StorageBackend, StorageConfig,
    WorkerConfig, MAX_KAFKA_CONCURRENCY,
};
pub use error::{ErrorMetadata, LogLevel, PipelineError, PoisonKind};
pub use job_error::{JobError, JobResultExt};
pub use metadata::merge_metadata;
