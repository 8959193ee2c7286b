mod helpers;

use helpers::{document, eventually, Harness, ScanBehavior};

use std::sync::Arc;
use std::time::Duration;

use docflow_core::models::{JobProvenance, JobStatus, ProcessDocumentRequest, UploadStatus};
use docflow_db::JobStore;
use docflow_storage::StorageArea;
use docflow_worker::{JobQueue, JobQueueConfig, Wakeup};
use uuid::Uuid;

const BYTES: &[u8] = b"%PDF-1.4 not really a pdf";

fn fast_config() -> JobQueueConfig {
    JobQueueConfig {
        concurrency: 2,
        poll_interval_ms: 20,
        lease: Duration::from_secs(30),
        stalled_check_secs: 1,
        drain_timeout_secs: 2,
        attempts: 3,
        backoff_ms: 10,
        remove_on_complete: true,
        remove_on_fail: 1000,
    }
}

fn queue(h: &Harness, config: JobQueueConfig) -> JobQueue {
    JobQueue::new(Arc::new(h.jobs.clone()), config)
}

fn provenance(offset: i64) -> JobProvenance {
    JobProvenance {
        topic: "document.uploaded".into(),
        partition: 0,
        offset,
        key: None,
    }
}

#[tokio::test]
async fn redelivered_event_returns_the_existing_job() {
    let h = Harness::new(ScanBehavior::Clean);
    let q = queue(&h, fast_config());
    let id = Uuid::new_v4();

    let first = q
        .enqueue(ProcessDocumentRequest::new(id), Some(provenance(7)))
        .await
        .unwrap();
    let second = q
        .enqueue(ProcessDocumentRequest::new(id), Some(provenance(7)))
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.id, second.id);
    assert_eq!(first.dedupe_key.as_deref(), Some("kafka_document.uploaded_0_7"));
    assert_eq!(h.jobs.jobs().len(), 1);

    let third = q
        .enqueue(ProcessDocumentRequest::new(id), Some(provenance(8)))
        .await
        .unwrap();
    assert!(third.created);
    assert_eq!(h.jobs.jobs().len(), 2);
}

#[tokio::test]
async fn job_payload_carries_request_and_provenance() {
    let h = Harness::new(ScanBehavior::Clean);
    let q = queue(&h, fast_config());
    let id = Uuid::new_v4();

    let handle = q
        .enqueue(ProcessDocumentRequest::new(id), Some(provenance(3)))
        .await
        .unwrap();
    let job = h.jobs.get(handle.id).await.unwrap().unwrap();
    let payload = job.parse_payload().unwrap();

    assert_eq!(payload.request.document_id, id);
    assert_eq!(payload.provenance, Some(provenance(3)));
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.backoff_ms, 10);
}

#[tokio::test]
async fn worker_pool_processes_and_reclaims_completed_jobs() {
    let h = Harness::new(ScanBehavior::Clean);
    let q = queue(&h, fast_config());
    let pool = q.start(h.processor.clone(), Wakeup::Local(h.jobs.notifier()));

    let doc = h.stage("application/pdf", "contract.pdf", BYTES);
    q.enqueue(ProcessDocumentRequest::new(doc.id), Some(provenance(1)))
        .await
        .unwrap();

    assert!(eventually(|| h.status(doc.id) == UploadStatus::Uploaded).await);
    assert!(eventually(|| h.jobs.jobs().is_empty()).await);
    pool.shutdown().await;

    assert_eq!(h.storage.areas_of(&doc.path), vec![StorageArea::Production]);
}

#[tokio::test]
async fn completed_jobs_are_kept_when_configured() {
    let h = Harness::new(ScanBehavior::Clean);
    let q = queue(
        &h,
        JobQueueConfig {
            remove_on_complete: false,
            ..fast_config()
        },
    );
    let pool = q.start(h.processor.clone(), Wakeup::Poll);

    let doc = h.stage("application/pdf", "kept.pdf", BYTES);
    let handle = q
        .enqueue(ProcessDocumentRequest::new(doc.id), Some(provenance(2)))
        .await
        .unwrap();

    assert!(eventually(|| h.jobs.count_with_status(JobStatus::Completed) == 1).await);
    pool.shutdown().await;

    let again = q
        .enqueue(ProcessDocumentRequest::new(doc.id), Some(provenance(2)))
        .await
        .unwrap();
    assert_eq!(again.id, handle.id);
    assert_eq!(again.status, JobStatus::Completed);
    assert!(!again.created);
}

#[tokio::test]
async fn retryable_failures_exhaust_the_budget_then_fail_the_document() {
    let h = Harness::new(ScanBehavior::Unavailable);
    let q = queue(
        &h,
        JobQueueConfig {
            attempts: 2,
            ..fast_config()
        },
    );
    let pool = q.start(h.processor.clone(), Wakeup::Local(h.jobs.notifier()));

    let doc = h.stage("application/pdf", "unscannable.pdf", BYTES);
    let handle = q
        .enqueue(ProcessDocumentRequest::new(doc.id), None)
        .await
        .unwrap();

    assert!(eventually(|| h.status(doc.id) == UploadStatus::Failed).await);
    assert!(eventually(|| h.jobs.count_with_status(JobStatus::Failed) == 1).await);
    pool.shutdown().await;

    let job = h.jobs.get(handle.id).await.unwrap().unwrap();
    assert_eq!(job.attempts_made, 2);
    assert_eq!(h.scanner.calls.load(std::sync::atomic::Ordering::SeqCst), 2);

    let failure = &h.metadata(doc.id)["processing"]["failure"];
    assert_eq!(failure["attempts"], 2);
    assert!(failure["message"]
        .as_str()
        .unwrap()
        .starts_with("Retries exhausted after 2 attempt(s)"));
    assert_eq!(failure["failed_storage"]["area"], "failed");
    assert_eq!(h.storage.areas_of(&doc.path), vec![StorageArea::Failed]);
}

#[tokio::test]
async fn unrecoverable_failure_is_not_retried() {
    let h = Harness::new(ScanBehavior::Clean);
    let q = queue(&h, fast_config());
    let pool = q.start(h.processor.clone(), Wakeup::Local(h.jobs.notifier()));

    let handle = q
        .enqueue(ProcessDocumentRequest::new(Uuid::new_v4()), None)
        .await
        .unwrap();

    assert!(eventually(|| h.jobs.count_with_status(JobStatus::Failed) == 1).await);
    pool.shutdown().await;

    let job = h.jobs.get(handle.id).await.unwrap().unwrap();
    assert_eq!(job.attempts_made, 1);
    assert!(job.last_error.unwrap().contains("Document not found"));
}

#[tokio::test]
async fn stalled_job_on_its_last_attempt_is_finalized_by_the_reaper() {
    let h = Harness::new(ScanBehavior::Clean);
    let q = queue(
        &h,
        JobQueueConfig {
            attempts: 1,
            ..fast_config()
        },
    );

    // A worker claimed the job, moved the document to PROCESSING and died.
    let doc = document("application/pdf", "orphan.pdf", UploadStatus::Processing);
    h.place(&doc, StorageArea::Staging, BYTES);
    let handle = q
        .enqueue(ProcessDocumentRequest::new(doc.id), None)
        .await
        .unwrap();
    let claimed = h.jobs.claim_next(Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(claimed.id, handle.id);
    h.jobs.expire_lease(handle.id);

    let pool = q.start(h.processor.clone(), Wakeup::Poll);
    assert!(eventually(|| h.status(doc.id) == UploadStatus::Failed).await);
    pool.shutdown().await;

    let job = h.jobs.get(handle.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(h.metadata(doc.id)["processing"]["failure"]["message"]
        .as_str()
        .unwrap()
        .contains("stalled"));
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_jobs() {
    let h = Harness::new(ScanBehavior::Clean);
    let q = queue(&h, fast_config());
    let pool = q.start(h.processor.clone(), Wakeup::Local(h.jobs.notifier()));

    let docs: Vec<_> = (0..4)
        .map(|i| h.stage("application/pdf", &format!("batch-{}.pdf", i), BYTES))
        .collect();
    for (i, doc) in docs.iter().enumerate() {
        q.enqueue(ProcessDocumentRequest::new(doc.id), Some(provenance(100 + i as i64)))
            .await
            .unwrap();
    }

    assert!(eventually(|| docs.iter().all(|d| h.status(d.id) == UploadStatus::Uploaded)).await);
    pool.shutdown().await;
    assert_eq!(h.jobs.count_with_status(JobStatus::Active), 0);
}
