//! Docflow Worker
//!
//! The scheduling half of the durable job queue (worker pool, retries with
//! backoff, lease renewal, stalled-job recovery) and the document processing
//! state machine that runs inside it.

pub mod context;
pub mod processor;
pub mod queue;

pub use context::{JobFailure, JobHandler};
pub use processor::{DocumentProcessor, ProcessingOutcome};
pub use queue::{JobQueue, JobQueueConfig, Wakeup, WorkerPool};
