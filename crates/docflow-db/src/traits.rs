//! Store abstractions used by the worker and the ingestor.
//!
//! Both have a Postgres implementation (`db`) and an in-memory one
//! (`memory`) so the pipeline can be exercised without a database.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use docflow_core::models::{Document, DocumentUpdate, Job, JobHandle, NewJob, UploadStatus};

/// Access to the document records the pipeline drives.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Document>>;

    /// Apply `update` only if the record is currently in `expected`.
    ///
    /// Returns false when the record is missing or its status differs, in
    /// which case nothing is written. Metadata is deep-merged.
    async fn update_if_status(
        &self,
        id: Uuid,
        expected: UploadStatus,
        update: DocumentUpdate,
    ) -> Result<bool>;
}

/// Jobs moved by one stalled-job sweep.
#[derive(Debug, Default)]
pub struct ReapedJobs {
    /// Jobs returned to `waiting`
    pub requeued: u64,
    /// Jobs that were out of attempts and are now `failed`
    pub exhausted: Vec<Job>,
}

/// Durable job queue persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job, or return the existing one with the same dedup key.
    async fn enqueue(&self, job: NewJob) -> Result<JobHandle>;

    /// Reserve the next runnable job for `lease`, counting a new attempt.
    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>>;

    /// Push the lease of an active job forward. False if the job is no
    /// longer active (reaped or finished).
    async fn extend_lease(&self, job_id: Uuid, lease: Duration) -> Result<bool>;

    /// Mark an active job completed, deleting the row when `remove` is set.
    /// A job that is no longer active is left alone.
    async fn complete(&self, job_id: Uuid, remove: bool) -> Result<()>;

    /// Release an active job for another attempt at `run_at`.
    async fn schedule_retry(&self, job_id: Uuid, run_at: DateTime<Utc>, error: &str)
        -> Result<()>;

    /// Mark an active job failed for good and keep only the newest `retain`
    /// failed jobs. A job that is no longer active is left alone.
    async fn fail(&self, job_id: Uuid, error: &str, retain: usize) -> Result<()>;

    /// Recover active jobs whose lease expired. Jobs out of attempts become
    /// failed, subject to the same `retain` bound as [`JobStore::fail`].
    async fn reap_stalled(&self, retain: usize) -> Result<ReapedJobs>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;
}
