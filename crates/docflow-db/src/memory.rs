//! In-memory stores with the same semantics as the Postgres repositories.
//!
//! Used by tests and for running the worker without a database. Locks are
//! never held across an `.await`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use docflow_core::merge_metadata;
use docflow_core::models::{
    Document, DocumentUpdate, Job, JobHandle, JobStatus, NewJob, UploadStatus,
};

use crate::traits::{DocumentStore, JobStore, ReapedJobs};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Document records kept in a map. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    documents: Arc<Mutex<HashMap<Uuid, Document>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: Document) {
        lock(&self.documents).insert(document.id, document);
    }

    /// Current copy of a record.
    pub fn snapshot(&self, id: Uuid) -> Option<Document> {
        lock(&self.documents).get(&id).cloned()
    }

    /// Overwrite the status without a precondition, simulating another writer.
    pub fn force_status(&self, id: Uuid, status: UploadStatus) {
        if let Some(doc) = lock(&self.documents).get_mut(&id) {
            doc.upload_status = status;
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.snapshot(id))
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: UploadStatus,
        update: DocumentUpdate,
    ) -> Result<bool> {
        let mut documents = lock(&self.documents);
        let Some(doc) = documents.get_mut(&id) else {
            return Ok(false);
        };
        if doc.upload_status != expected {
            return Ok(false);
        }

        if let Some(status) = update.upload_status {
            doc.upload_status = status;
        }
        if let Some(patch) = update.metadata {
            let base = doc
                .metadata
                .get_or_insert_with(|| serde_json::Value::Object(Default::default()));
            if !base.is_object() {
                *base = serde_json::Value::Object(Default::default());
            }
            merge_metadata(base, patch);
        }
        if let Some(size) = update.size {
            doc.size = Some(size);
        }
        Ok(true)
    }
}

/// Job queue kept in a map. Clones share state.
///
/// `notify` fires on every new job, standing in for `pg_notify`.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
    notify: Arc<Notify>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = lock(&self.jobs).values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        lock(&self.jobs)
            .values()
            .filter(|job| job.status == status)
            .count()
    }

    /// Expire the lease of an active job, simulating a crashed worker.
    pub fn expire_lease(&self, job_id: Uuid) {
        if let Some(job) = lock(&self.jobs).get_mut(&job_id) {
            job.locked_until = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }

    fn prune_failed(jobs: &mut HashMap<Uuid, Job>, retain: usize) {
        let mut failed: Vec<(Option<DateTime<Utc>>, Uuid)> = jobs
            .values()
            .filter(|job| job.status == JobStatus::Failed)
            .map(|job| (job.finished_at, job.id))
            .collect();
        if failed.len() <= retain {
            return;
        }
        failed.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for (_, id) in failed.into_iter().skip(retain) {
            jobs.remove(&id);
        }
    }
}

fn lease_deadline(lease: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<JobHandle> {
        let handle = {
            let mut jobs = lock(&self.jobs);
            if let Some(key) = new_job.dedupe_key.as_deref() {
                if let Some(existing) = jobs
                    .values()
                    .find(|job| job.dedupe_key.as_deref() == Some(key))
                {
                    return Ok(JobHandle::from_job(existing, false));
                }
            }

            let now = Utc::now();
            let job = Job {
                id: Uuid::new_v4(),
                dedupe_key: new_job.dedupe_key,
                payload: new_job.payload,
                status: JobStatus::Waiting,
                attempts_made: 0,
                max_attempts: new_job.max_attempts,
                backoff_ms: new_job.backoff_ms,
                run_at: now,
                locked_until: None,
                last_error: None,
                created_at: now,
                updated_at: now,
                finished_at: None,
            };
            let handle = JobHandle::from_job(&job, true);
            jobs.insert(job.id, job);
            handle
        };

        self.notify.notify_one();
        Ok(handle)
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>> {
        let mut jobs = lock(&self.jobs);
        let now = Utc::now();
        let next = jobs
            .values()
            .filter(|job| matches!(job.status, JobStatus::Waiting | JobStatus::Delayed))
            .filter(|job| job.run_at <= now)
            .min_by_key(|job| (job.run_at, job.created_at))
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).context("Claimed job disappeared")?;
        job.status = JobStatus::Active;
        job.attempts_made += 1;
        job.locked_until = Some(lease_deadline(lease));
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn extend_lease(&self, job_id: Uuid, lease: Duration) -> Result<bool> {
        let mut jobs = lock(&self.jobs);
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Active => {
                job.locked_until = Some(lease_deadline(lease));
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, job_id: Uuid, remove: bool) -> Result<()> {
        let mut jobs = lock(&self.jobs);
        let active = jobs
            .get(&job_id)
            .is_some_and(|job| job.status == JobStatus::Active);
        if !active {
            return Ok(());
        }
        if remove {
            jobs.remove(&job_id);
        } else if let Some(job) = jobs.get_mut(&job_id) {
            let now = Utc::now();
            job.status = JobStatus::Completed;
            job.locked_until = None;
            job.finished_at = Some(now);
            job.updated_at = now;
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        job_id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let mut jobs = lock(&self.jobs);
        if let Some(job) = jobs.get_mut(&job_id) {
            if job.status != JobStatus::Active {
                return Ok(());
            }
            let now = Utc::now();
            job.status = if run_at > now {
                JobStatus::Delayed
            } else {
                JobStatus::Waiting
            };
            job.run_at = run_at;
            job.last_error = Some(error.to_string());
            job.locked_until = None;
            job.updated_at = now;
        }
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str, retain: usize) -> Result<()> {
        let mut jobs = lock(&self.jobs);
        if let Some(job) = jobs.get_mut(&job_id) {
            if job.status != JobStatus::Active {
                return Ok(());
            }
            let now = Utc::now();
            job.status = JobStatus::Failed;
            job.last_error = Some(error.to_string());
            job.locked_until = None;
            job.finished_at = Some(now);
            job.updated_at = now;
        }
        Self::prune_failed(&mut jobs, retain);
        Ok(())
    }

    async fn reap_stalled(&self, retain: usize) -> Result<ReapedJobs> {
        let mut jobs = lock(&self.jobs);
        let now = Utc::now();
        let mut reaped = ReapedJobs::default();

        for job in jobs.values_mut() {
            let expired = job.status == JobStatus::Active
                && job.locked_until.map(|until| until < now).unwrap_or(false);
            if !expired {
                continue;
            }
            job.locked_until = None;
            job.updated_at = now;
            if job.attempts_made >= job.max_attempts {
                job.status = JobStatus::Failed;
                job.last_error = Some("job stalled: lease expired on final attempt".to_string());
                job.finished_at = Some(now);
                reaped.exhausted.push(job.clone());
            } else {
                job.status = JobStatus::Waiting;
                job.run_at = now;
                job.last_error = Some("job stalled: lease expired".to_string());
                reaped.requeued += 1;
            }
        }

        if !reaped.exhausted.is_empty() {
            Self::prune_failed(&mut jobs, retain);
        }
        Ok(reaped)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(lock(&self.jobs).get(&job_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_job(key: Option<&str>) -> NewJob {
        NewJob {
            payload: json!({ "document_id": Uuid::new_v4() }),
            dedupe_key: key.map(str::to_string),
            max_attempts: 2,
            backoff_ms: 10,
        }
    }

    #[tokio::test]
    async fn claim_counts_attempts_and_skips_active_jobs() {
        let store = MemoryJobStore::new();
        let handle = store.enqueue(new_job(None)).await.unwrap();

        let job = store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, handle.id);
        assert_eq!(job.attempts_made, 1);
        assert!(store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delayed_jobs_wait_for_run_at() {
        let store = MemoryJobStore::new();
        store.enqueue(new_job(None)).await.unwrap();
        let job = store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        store
            .schedule_retry(job.id, Utc::now() + chrono::Duration::hours(1), "boom")
            .await
            .unwrap();
        assert_eq!(store.count_with_status(JobStatus::Delayed), 1);
        assert!(store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn reaper_requeues_then_fails_exhausted_jobs() {
        let store = MemoryJobStore::new();
        store.enqueue(new_job(None)).await.unwrap();

        let job = store.claim_next(Duration::from_secs(60)).await.unwrap().unwrap();
        store.expire_lease(job.id);
        let reaped = store.reap_stalled(10).await.unwrap();
        assert_eq!(reaped.requeued, 1);
        assert!(reaped.exhausted.is_empty());

        let job = store.claim_next(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);
        store.expire_lease(job.id);
        let reaped = store.reap_stalled(10).await.unwrap();
        assert_eq!(reaped.requeued, 0);
        assert_eq!(reaped.exhausted.len(), 1);
        assert_eq!(store.count_with_status(JobStatus::Failed), 1);
    }

    #[tokio::test]
    async fn late_runner_cannot_overwrite_a_reaped_job() {
        let store = MemoryJobStore::new();
        let handle = store.enqueue(new_job(None)).await.unwrap();
        let stale = store.claim_next(Duration::from_secs(60)).await.unwrap().unwrap();
        store.expire_lease(stale.id);
        assert_eq!(store.reap_stalled(10).await.unwrap().requeued, 1);

        store.complete(stale.id, true).await.unwrap();
        store.fail(stale.id, "late failure", 10).await.unwrap();
        let job = store.get(handle.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.last_error.as_deref(), Some("job stalled: lease expired"));

        store.complete(stale.id, false).await.unwrap();
        assert_eq!(
            store.get(handle.id).await.unwrap().unwrap().status,
            JobStatus::Waiting
        );

        // The second claim owns the job now.
        let fresh = store.claim_next(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(fresh.attempts_made, 2);
        store.complete(fresh.id, true).await.unwrap();
        assert!(store.get(handle.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_jobs_are_pruned_to_retention() {
        let store = MemoryJobStore::new();
        for _ in 0..3 {
            store.enqueue(new_job(None)).await.unwrap();
            let job = store.claim_next(Duration::from_secs(60)).await.unwrap().unwrap();
            store.fail(job.id, "boom", 2).await.unwrap();
        }
        assert_eq!(store.count_with_status(JobStatus::Failed), 2);
    }

    #[tokio::test]
    async fn metadata_updates_merge_under_status_precondition() {
        let store = MemoryDocumentStore::new();
        let id = Uuid::new_v4();
        store.insert(Document {
            id,
            path: "k".into(),
            mime_type: None,
            original_name: None,
            size: Some(1),
            upload_status: UploadStatus::Processing,
            metadata: Some(json!({ "processing": { "failure": { "message": "x" } } })),
        });

        let stale = store
            .update_if_status(
                id,
                UploadStatus::Staging,
                DocumentUpdate::status(UploadStatus::Processing),
            )
            .await
            .unwrap();
        assert!(!stale);

        let applied = store
            .update_if_status(
                id,
                UploadStatus::Processing,
                DocumentUpdate::status(UploadStatus::Uploaded)
                    .with_metadata(json!({ "processing": { "image": { "level": 80 } } }))
                    .with_size(7),
            )
            .await
            .unwrap();
        assert!(applied);

        let doc = store.snapshot(id).unwrap();
        assert_eq!(doc.upload_status, UploadStatus::Uploaded);
        assert_eq!(doc.size, Some(7));
        let metadata = doc.metadata.unwrap();
        assert_eq!(metadata["processing"]["failure"]["message"], "x");
        assert_eq!(metadata["processing"]["image"]["level"], 80);
    }
}
