mod helpers;

use helpers::{document, Harness, ScanBehavior, EICAR};

use docflow_core::models::{
    CompressionOptions, MediaProcessingOptions, ProcessDocumentRequest, UploadStatus,
};
use docflow_core::{ErrorMetadata, JobError, PipelineError};
use docflow_db::MemoryDocumentStore;
use docflow_storage::{StorageArea, StorageOp};
use docflow_worker::JobFailure;
use serde_json::json;
use uuid::Uuid;

const PHOTO: &[u8] = b"0123456789abcdef0123456789abcdef";

fn with_image_level(id: Uuid, level: i64) -> ProcessDocumentRequest {
    ProcessDocumentRequest {
        image_processing_opts: Some(MediaProcessingOptions {
            compression: Some(CompressionOptions { level }),
        }),
        ..ProcessDocumentRequest::new(id)
    }
}

fn error_code(err: &JobError) -> Option<&'static str> {
    err.inner()
        .downcast_ref::<PipelineError>()
        .map(|e| e.error_code())
}

#[tokio::test]
async fn clean_image_is_compressed_and_published() {
    let h = Harness::new(ScanBehavior::Clean);
    let doc = h.stage("image/jpeg", "photo.jpg", PHOTO);

    let outcome = h
        .processor
        .process(&with_image_level(doc.id, 80))
        .await
        .unwrap();

    assert_eq!(outcome.upload_status, UploadStatus::Uploaded);
    assert!(!outcome.is_quarantined);
    assert!(outcome.signed_url.unwrap().contains("ttl=600"));
    assert_eq!(*h.image_transcoder.levels.lock().unwrap(), vec![80]);

    assert_eq!(h.storage.areas_of(&doc.path), vec![StorageArea::Production]);
    let published = h.storage.get(StorageArea::Production, &doc.path).unwrap();
    assert_eq!(published.len(), PHOTO.len() / 2);

    let stored = h.documents.snapshot(doc.id).unwrap();
    assert_eq!(stored.upload_status, UploadStatus::Uploaded);
    assert_eq!(stored.size, Some((PHOTO.len() / 2) as i64));

    let metadata = h.metadata(doc.id);
    assert_eq!(metadata["kind"], "stub");
    assert_eq!(metadata["size"], PHOTO.len() / 2);
    assert_eq!(metadata["processing"]["image"]["compression"]["level"], 80);
}

#[tokio::test]
async fn without_compression_options_bytes_are_moved_untouched() {
    let h = Harness::new(ScanBehavior::Clean);
    let doc = h.stage("image/png", "logo.png", PHOTO);

    h.processor
        .process(&ProcessDocumentRequest::new(doc.id))
        .await
        .unwrap();

    assert!(h.image_transcoder.levels.lock().unwrap().is_empty());
    assert_eq!(h.storage.count(StorageOp::Copy, StorageArea::Production), 1);
    assert_eq!(h.storage.count(StorageOp::Upload, StorageArea::Production), 0);
    assert_eq!(
        h.storage.get(StorageArea::Production, &doc.path).unwrap(),
        PHOTO
    );
    assert!(h.metadata(doc.id).get("processing").is_none());
}

#[tokio::test]
async fn options_for_another_kind_do_not_trigger_a_transcoder() {
    let h = Harness::new(ScanBehavior::Clean);
    let doc = h.stage("application/pdf", "report.pdf", PHOTO);

    h.processor
        .process(&with_image_level(doc.id, 30))
        .await
        .unwrap();

    assert!(h.image_transcoder.levels.lock().unwrap().is_empty());
    assert_eq!(h.status(doc.id), UploadStatus::Uploaded);
}

#[tokio::test]
async fn infected_document_is_quarantined() {
    let h = Harness::new(ScanBehavior::Infected(vec![EICAR.to_string()]));
    let doc = h.stage("image/jpeg", "eicar.jpg", PHOTO);

    let outcome = h
        .processor
        .process(&with_image_level(doc.id, 80))
        .await
        .unwrap();

    assert!(outcome.is_quarantined);
    assert_eq!(outcome.upload_status, UploadStatus::InQuarantine);
    assert_eq!(outcome.viruses, vec![EICAR.to_string()]);
    assert!(outcome.signed_url.is_none());

    assert_eq!(h.status(doc.id), UploadStatus::InQuarantine);
    assert_eq!(h.storage.areas_of(&doc.path), vec![StorageArea::Quarantine]);
    assert!(h.image_transcoder.levels.lock().unwrap().is_empty());

    let metadata = h.metadata(doc.id);
    assert_eq!(metadata["scan"]["isInfected"], true);
    assert_eq!(metadata["scan"]["viruses"], json!([EICAR]));
}

#[tokio::test]
async fn scanner_outage_is_retryable_and_leaves_bytes_in_staging() {
    let h = Harness::new(ScanBehavior::Unavailable);
    let doc = h.stage("image/jpeg", "photo.jpg", PHOTO);

    let err = h
        .processor
        .process(&ProcessDocumentRequest::new(doc.id))
        .await
        .unwrap_err();

    assert!(err.is_recoverable());
    assert_eq!(error_code(&err), Some("CAPABILITY_FAILURE"));
    assert_eq!(h.status(doc.id), UploadStatus::Processing);
    assert_eq!(h.storage.areas_of(&doc.path), vec![StorageArea::Staging]);
}

#[tokio::test]
async fn missing_document_is_not_retried() {
    let h = Harness::new(ScanBehavior::Clean);

    let err = h
        .processor
        .process(&ProcessDocumentRequest::new(Uuid::new_v4()))
        .await
        .unwrap_err();

    assert!(!err.is_recoverable());
    assert_eq!(error_code(&err), Some("DOCUMENT_NOT_FOUND"));
    assert_eq!(h.scanner.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn terminal_document_is_left_alone() {
    let h = Harness::new(ScanBehavior::Clean);
    let doc = document("image/jpeg", "done.jpg", UploadStatus::Uploaded);
    h.place(&doc, StorageArea::Production, PHOTO);

    let err = h
        .processor
        .process(&ProcessDocumentRequest::new(doc.id))
        .await
        .unwrap_err();

    assert!(!err.is_recoverable());
    assert_eq!(error_code(&err), Some("INELIGIBLE_STATE"));
    assert_eq!(h.status(doc.id), UploadStatus::Uploaded);
    assert_eq!(h.storage.count(StorageOp::Download, StorageArea::Staging), 0);
}

#[tokio::test]
async fn concurrent_terminal_write_wins_over_this_worker() {
    let documents = MemoryDocumentStore::new();
    let doc = document("image/jpeg", "race.jpg", UploadStatus::Staging);
    let h = Harness::with_documents(
        documents.clone(),
        ScanBehavior::Interfere(documents, doc.id, UploadStatus::Failed),
    );
    h.place(&doc, StorageArea::Staging, PHOTO);

    let err = h
        .processor
        .process(&ProcessDocumentRequest::new(doc.id))
        .await
        .unwrap_err();

    assert!(!err.is_recoverable());
    assert_eq!(error_code(&err), Some("STATE_CONFLICT"));
    assert_eq!(h.status(doc.id), UploadStatus::Failed);
    assert!(h.metadata(doc.id).is_null());
}

#[tokio::test]
async fn existing_metadata_survives_a_successful_run() {
    let h = Harness::new(ScanBehavior::Clean);
    let mut doc = document("image/jpeg", "retry.jpg", UploadStatus::Processing);
    doc.metadata = Some(json!({
        "tenant": "acme",
        "processing": { "failure": { "message": "scanner down", "at": "2024-05-01T10:00:00.000Z" } }
    }));
    h.place(&doc, StorageArea::Staging, PHOTO);

    h.processor
        .process(&with_image_level(doc.id, 80))
        .await
        .unwrap();

    let metadata = h.metadata(doc.id);
    assert_eq!(metadata["tenant"], "acme");
    assert_eq!(metadata["processing"]["failure"]["message"], "scanner down");
    assert_eq!(metadata["processing"]["image"]["compression"]["level"], 80);
    assert_eq!(metadata["kind"], "stub");
}

#[tokio::test]
async fn resumes_from_production_after_a_crash() {
    let h = Harness::new(ScanBehavior::Clean);
    let doc = document("image/jpeg", "half-done.jpg", UploadStatus::Processing);
    h.place(&doc, StorageArea::Production, PHOTO);

    let outcome = h
        .processor
        .process(&with_image_level(doc.id, 80))
        .await
        .unwrap();

    assert_eq!(outcome.upload_status, UploadStatus::Uploaded);
    assert!(outcome.signed_url.is_some());
    assert_eq!(h.scanner.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(h.image_transcoder.levels.lock().unwrap().is_empty());

    let stored = h.documents.snapshot(doc.id).unwrap();
    assert_eq!(stored.size, Some(PHOTO.len() as i64));
    assert_eq!(
        stored.metadata.unwrap()["processing"]["resumed_from"],
        "production"
    );
}

#[tokio::test]
async fn resumes_from_quarantine_after_a_crash() {
    let h = Harness::new(ScanBehavior::Infected(vec!["Win.Test.EICAR_HDB-1".into()]));
    let doc = document("image/jpeg", "bad.jpg", UploadStatus::Processing);
    h.place(&doc, StorageArea::Quarantine, PHOTO);

    let outcome = h
        .processor
        .process(&ProcessDocumentRequest::new(doc.id))
        .await
        .unwrap();

    assert!(outcome.is_quarantined);
    assert_eq!(outcome.viruses, vec!["Win.Test.EICAR_HDB-1".to_string()]);
    assert_eq!(h.status(doc.id), UploadStatus::InQuarantine);
    let metadata = h.metadata(doc.id);
    assert_eq!(metadata["scan"]["isInfected"], true);
    assert_eq!(metadata["scan"]["viruses"], json!(["Win.Test.EICAR_HDB-1"]));
    assert_eq!(metadata["processing"]["resumed_from"], "quarantine");
    assert_eq!(h.storage.areas_of(&doc.path), vec![StorageArea::Quarantine]);
}

#[tokio::test]
async fn quarantine_resume_keeps_bytes_quarantined_when_rescan_is_clean() {
    let h = Harness::new(ScanBehavior::Clean);
    let doc = document("application/pdf", "macro.pdf", UploadStatus::Processing);
    h.place(&doc, StorageArea::Quarantine, PHOTO);

    let outcome = h
        .processor
        .process(&ProcessDocumentRequest::new(doc.id))
        .await
        .unwrap();

    assert!(outcome.is_quarantined);
    assert!(outcome.viruses.is_empty());
    assert_eq!(h.status(doc.id), UploadStatus::InQuarantine);
    assert_eq!(h.storage.areas_of(&doc.path), vec![StorageArea::Quarantine]);
}

#[tokio::test]
async fn quarantine_resume_retries_when_the_scanner_is_down() {
    let h = Harness::new(ScanBehavior::Unavailable);
    let doc = document("image/jpeg", "bad.jpg", UploadStatus::Processing);
    h.place(&doc, StorageArea::Quarantine, PHOTO);

    let err = h
        .processor
        .process(&ProcessDocumentRequest::new(doc.id))
        .await
        .unwrap_err();

    assert!(err.is_recoverable());
    assert_eq!(h.status(doc.id), UploadStatus::Processing);
}

#[tokio::test]
async fn bytes_missing_everywhere_is_retryable() {
    let h = Harness::new(ScanBehavior::Clean);
    let doc = document("image/jpeg", "ghost.jpg", UploadStatus::Staging);
    h.documents.insert(doc.clone());

    let err = h
        .processor
        .process(&ProcessDocumentRequest::new(doc.id))
        .await
        .unwrap_err();

    assert!(err.is_recoverable());
    assert_eq!(error_code(&err), Some("STORAGE_FAILURE"));
    assert_eq!(h.status(doc.id), UploadStatus::Processing);
}

#[tokio::test]
async fn finalizer_moves_bytes_to_failed_area() {
    let h = Harness::new(ScanBehavior::Clean);
    let doc = document("image/jpeg", "broken.jpg", UploadStatus::Processing);
    h.place(&doc, StorageArea::Staging, PHOTO);

    let failure = JobFailure {
        message: "Retries exhausted after 3 attempt(s): malware scan failed".into(),
        stack: Some("malware scan failed\n\nCaused by: refused".into()),
    };
    let applied = h
        .processor
        .finalize_failure(doc.id, &failure, 3)
        .await
        .unwrap();

    assert!(applied);
    assert_eq!(h.status(doc.id), UploadStatus::Failed);
    assert_eq!(h.storage.areas_of(&doc.path), vec![StorageArea::Failed]);

    let recorded = &h.metadata(doc.id)["processing"]["failure"];
    assert_eq!(recorded["message"], failure.message);
    assert_eq!(recorded["attempts"], 3);
    assert!(recorded["stack"].as_str().unwrap().contains("refused"));
    assert!(recorded["at"].as_str().unwrap().ends_with('Z'));
    assert_eq!(
        recorded["failed_storage"],
        json!({ "area": "failed", "key": doc.path })
    );
}

#[tokio::test]
async fn finalizer_records_a_failed_move_and_still_fails_the_document() {
    let h = Harness::new(ScanBehavior::Clean);
    let doc = document("image/jpeg", "stuck.jpg", UploadStatus::Processing);
    h.place(&doc, StorageArea::Staging, PHOTO);
    h.storage.fail_on(StorageOp::Copy, StorageArea::Failed);

    let applied = h
        .processor
        .finalize_failure(doc.id, &JobFailure::message("transcoder crashed"), 1)
        .await
        .unwrap();

    assert!(applied);
    assert_eq!(h.status(doc.id), UploadStatus::Failed);
    assert_eq!(h.storage.areas_of(&doc.path), vec![StorageArea::Staging]);

    let recorded = &h.metadata(doc.id)["processing"]["failure"];
    assert_eq!(recorded["failed_storage"]["skipped"], true);
    assert!(recorded["failed_storage"]["error"]
        .as_str()
        .unwrap()
        .contains("injected"));
    assert!(recorded.get("stack").is_none());
}

#[tokio::test]
async fn finalizer_never_downgrades_a_terminal_document() {
    let h = Harness::new(ScanBehavior::Clean);
    let doc = document("image/jpeg", "ok.jpg", UploadStatus::Uploaded);
    h.place(&doc, StorageArea::Production, PHOTO);

    let applied = h
        .processor
        .finalize_failure(doc.id, &JobFailure::message("late failure"), 3)
        .await
        .unwrap();

    assert!(!applied);
    assert_eq!(h.status(doc.id), UploadStatus::Uploaded);
    assert_eq!(h.storage.areas_of(&doc.path), vec![StorageArea::Production]);
    assert_eq!(h.storage.count(StorageOp::Copy, StorageArea::Failed), 0);
}

#[tokio::test]
async fn finalizer_ignores_missing_document() {
    let h = Harness::new(ScanBehavior::Clean);
    let applied = h
        .processor
        .finalize_failure(Uuid::new_v4(), &JobFailure::message("gone"), 1)
        .await
        .unwrap();
    assert!(!applied);
}
