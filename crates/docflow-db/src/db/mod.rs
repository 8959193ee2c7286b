//! Postgres repositories.
//!
//! `DocumentRepository` writes the document record under a status
//! precondition; `JobRepository` backs the durable job queue.

pub mod document;
pub mod job;

pub use document::DocumentRepository;
pub use job::{JobRepository, JOB_NOTIFY_CHANNEL};
