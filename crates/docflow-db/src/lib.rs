//! Docflow Database Layer
//!
//! Document record store and durable job queue persistence, with Postgres
//! repositories and in-memory equivalents behind the same traits.

pub mod db;
pub mod memory;
pub mod traits;

pub use db::{DocumentRepository, JobRepository, JOB_NOTIFY_CHANNEL};
pub use memory::{MemoryDocumentStore, MemoryJobStore};
pub use traits::{DocumentStore, JobStore, ReapedJobs};
