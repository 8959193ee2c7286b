//! Document processing state machine
//!
//! STAGING → PROCESSING → {UPLOADED, IN_QUARANTINE, FAILED}. Every status
//! write is a compare-and-swap on the current status, so two workers holding
//! the same document can never both move it to a terminal state, and a
//! terminal record is never touched again.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use docflow_core::models::{
    Document, DocumentUpdate, Job, MediaKind, ProcessDocumentRequest, ScanResult, UploadStatus,
};
use docflow_core::{merge_metadata, JobError, JobResultExt, PipelineError};
use docflow_db::DocumentStore;
use docflow_processing::{MetadataExtractor, TranscodeOutput, Transcoders};
use docflow_services::MalwareScanner;
use docflow_storage::{AreaStorage, StorageArea};

use crate::context::{JobFailure, JobHandler};

/// Result of one successful processing run, logged as the job result.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProcessingOutcome {
    pub document_id: Uuid,
    pub upload_status: UploadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_url: Option<String>,
    pub is_quarantined: bool,
    pub viruses: Vec<String>,
}

/// Bytes headed for production and how they were produced.
struct Prepared {
    bytes: Bytes,
    rewritten: bool,
    processing: Map<String, Value>,
}

pub struct DocumentProcessor {
    documents: Arc<dyn DocumentStore>,
    storage: Arc<dyn AreaStorage>,
    scanner: Arc<dyn MalwareScanner>,
    transcoders: Transcoders,
    extractor: Arc<dyn MetadataExtractor>,
    signed_url_ttl: Duration,
}

impl DocumentProcessor {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        storage: Arc<dyn AreaStorage>,
        scanner: Arc<dyn MalwareScanner>,
        transcoders: Transcoders,
        extractor: Arc<dyn MetadataExtractor>,
    ) -> Self {
        Self {
            documents,
            storage,
            scanner,
            transcoders,
            extractor,
            signed_url_ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_signed_url_ttl(mut self, ttl: Duration) -> Self {
        self.signed_url_ttl = ttl;
        self
    }

    /// Drive one document from STAGING (or a crashed PROCESSING attempt) to
    /// UPLOADED or IN_QUARANTINE.
    #[tracing::instrument(skip(self, request), fields(document_id = %request.document_id))]
    pub async fn process(
        &self,
        request: &ProcessDocumentRequest,
    ) -> Result<ProcessingOutcome, JobError> {
        let start = Instant::now();
        let document = self.load(request.document_id).await?;
        let document = self.begin(document).await?;

        let bytes = match self.storage.download(StorageArea::Staging, &document.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return self.resume(&document).await,
            Err(e) => return Err(PipelineError::storage("download", e).into()),
        };

        let scan = self
            .scanner
            .scan(&bytes, self.display_name(&document))
            .await
            .map_err(|e| PipelineError::capability("malware scan", e))?;

        if scan.is_infected {
            return self.quarantine(&document, &scan).await;
        }

        let original_size = bytes.len();
        let prepared = self.prepare(&document, request, bytes).await?;
        let metadata = self.extract_metadata(&document, &prepared.bytes).await?;

        if prepared.rewritten {
            self.storage
                .upload(
                    StorageArea::Production,
                    &document.path,
                    prepared.bytes.clone(),
                    document.mime_type.as_deref(),
                )
                .await
                .map_err(|e| PipelineError::storage("upload", e))?;
            self.storage
                .delete(StorageArea::Staging, &document.path)
                .await
                .map_err(|e| PipelineError::storage("delete", e))?;
        } else {
            self.storage
                .move_between_areas(StorageArea::Staging, StorageArea::Production, &document.path)
                .await
                .map_err(|e| PipelineError::storage("move", e))?;
        }

        let outcome = self
            .finish_uploaded(&document, metadata, prepared.processing, prepared.bytes.len())
            .await?;

        tracing::info!(
            document_id = %document.id,
            original_size = original_size,
            final_size = prepared.bytes.len(),
            rewritten = prepared.rewritten,
            duration_ms = start.elapsed().as_millis() as u64,
            "Document uploaded"
        );

        Ok(outcome)
    }

    /// Record a terminal failure for a document still in PROCESSING.
    ///
    /// The staging bytes are moved to the failed area on a best-effort basis;
    /// the outcome of the move is part of the failure annotation. Returns
    /// whether the record was moved to FAILED.
    #[tracing::instrument(skip(self, failure), fields(document_id = %document_id))]
    pub async fn finalize_failure(
        &self,
        document_id: Uuid,
        failure: &JobFailure,
        attempts: i32,
    ) -> Result<bool> {
        let Some(document) = self
            .documents
            .get(document_id)
            .await
            .context("Failed to load document for failure finalization")?
        else {
            tracing::debug!("Document no longer exists, nothing to finalize");
            return Ok(false);
        };

        if document.upload_status != UploadStatus::Processing {
            tracing::info!(
                upload_status = %document.upload_status,
                "Document is not PROCESSING, leaving it as is"
            );
            return Ok(false);
        }

        let failed_storage = match self
            .storage
            .move_between_areas(StorageArea::Staging, StorageArea::Failed, &document.path)
            .await
        {
            Ok(()) => json!({ "area": StorageArea::Failed.as_str(), "key": document.path }),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    key = %document.path,
                    "Could not move staging bytes to the failed area"
                );
                json!({ "skipped": true, "error": e.to_string() })
            }
        };

        let mut annotation = json!({
            "at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "message": failure.message,
            "failed_storage": failed_storage,
            "attempts": attempts,
        });
        if let Some(stack) = &failure.stack {
            annotation["stack"] = Value::String(stack.clone());
        }

        let applied = self
            .documents
            .update_if_status(
                document_id,
                UploadStatus::Processing,
                DocumentUpdate::status(UploadStatus::Failed)
                    .with_metadata(json!({ "processing": { "failure": annotation } })),
            )
            .await
            .context("Failed to mark document as FAILED")?;

        if applied {
            tracing::warn!(message = %failure.message, attempts = attempts, "Document marked FAILED");
        } else {
            tracing::info!("Document left PROCESSING before the failure could be recorded");
        }
        Ok(applied)
    }

    async fn load(&self, id: Uuid) -> Result<Document, JobError> {
        self.documents
            .get(id)
            .await
            .context("Failed to load document")?
            .ok_or_else(|| PipelineError::NotFound(id).into())
    }

    /// Claim the document for processing.
    async fn begin(&self, document: Document) -> Result<Document, JobError> {
        match document.upload_status {
            UploadStatus::Processing => {
                tracing::info!("Resuming document already in PROCESSING");
                Ok(document)
            }
            UploadStatus::Staging => {
                let claimed = self
                    .documents
                    .update_if_status(
                        document.id,
                        UploadStatus::Staging,
                        DocumentUpdate::status(UploadStatus::Processing),
                    )
                    .await
                    .context("Failed to mark document as PROCESSING")?;
                if claimed {
                    return Ok(Document {
                        upload_status: UploadStatus::Processing,
                        ..document
                    });
                }

                // Someone else moved it first; only keep going if it is still in flight.
                let current = self.load(document.id).await?;
                match current.upload_status {
                    UploadStatus::Processing => Ok(current),
                    status => Err(PipelineError::IneligibleState {
                        document_id: current.id,
                        status,
                    }
                    .into()),
                }
            }
            status => Err(PipelineError::IneligibleState {
                document_id: document.id,
                status,
            }
            .into()),
        }
    }

    /// Run the transcoder for the document's kind when compression was asked for.
    async fn prepare(
        &self,
        document: &Document,
        request: &ProcessDocumentRequest,
        bytes: Bytes,
    ) -> Result<Prepared, JobError> {
        let unchanged = |bytes: Bytes| Prepared {
            bytes,
            rewritten: false,
            processing: Map::new(),
        };

        let Some(kind) = MediaKind::from_mime(&document.mime()) else {
            return Ok(unchanged(bytes));
        };
        let Some(compression) = request.compression_for(kind) else {
            return Ok(unchanged(bytes));
        };
        let Some(transcoder) = self.transcoders.for_kind(kind) else {
            tracing::debug!(kind = kind.as_str(), "No transcoder enabled for kind");
            return Ok(unchanged(bytes));
        };

        let output = transcoder
            .transcode(document, bytes.clone(), compression.clamped_level())
            .await
            .map_err(|e| PipelineError::capability(transcode_capability(kind), e))?;

        let mut processing = Map::new();
        processing.insert(kind.as_str().to_string(), output.processing().clone());

        Ok(match output {
            TranscodeOutput::Rewritten { bytes, .. } => Prepared {
                bytes,
                rewritten: true,
                processing,
            },
            TranscodeOutput::Unchanged { .. } => Prepared {
                bytes,
                rewritten: false,
                processing,
            },
        })
    }

    async fn extract_metadata(&self, document: &Document, bytes: &[u8]) -> Result<Value, JobError> {
        self.extractor
            .extract(document, bytes)
            .await
            .map_err(|e| PipelineError::capability("metadata extraction", e).into())
    }

    async fn quarantine(
        &self,
        document: &Document,
        scan: &ScanResult,
    ) -> Result<ProcessingOutcome, JobError> {
        tracing::warn!(
            document_id = %document.id,
            viruses = ?scan.viruses,
            "Malware detected, quarantining document"
        );

        self.storage
            .move_between_areas(StorageArea::Staging, StorageArea::Quarantine, &document.path)
            .await
            .map_err(|e| PipelineError::storage("quarantine move", e))?;

        let metadata = json!({
            "scan": {
                "isInfected": true,
                "viruses": scan.viruses,
                "scannedAt": scan.scan_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            }
        });
        self.finish(document, UploadStatus::InQuarantine, metadata, None)
            .await?;

        Ok(ProcessingOutcome {
            document_id: document.id,
            upload_status: UploadStatus::InQuarantine,
            signed_url: None,
            is_quarantined: true,
            viruses: scan.viruses.clone(),
        })
    }

    /// The staging object is gone: a previous attempt got past the move.
    /// Finish from wherever the bytes ended up.
    async fn resume(&self, document: &Document) -> Result<ProcessingOutcome, JobError> {
        let key = &document.path;

        let in_production = self
            .storage
            .exists(StorageArea::Production, key)
            .await
            .map_err(|e| PipelineError::storage("exists", e))?;
        if in_production {
            tracing::info!(key = %key, "Staging object missing, resuming from production");
            let bytes = self
                .storage
                .download(StorageArea::Production, key)
                .await
                .map_err(|e| PipelineError::storage("download", e))?;
            let metadata = self.extract_metadata(document, &bytes).await?;
            let mut processing = Map::new();
            processing.insert("resumed_from".into(), json!("production"));
            return self
                .finish_uploaded(document, metadata, processing, bytes.len())
                .await;
        }

        let in_quarantine = self
            .storage
            .exists(StorageArea::Quarantine, key)
            .await
            .map_err(|e| PipelineError::storage("exists", e))?;
        if in_quarantine {
            tracing::info!(key = %key, "Staging object missing, resuming from quarantine");
            // The signatures of the first scan were never stored; scan the
            // quarantined copy again to recover them. The bytes stay in
            // quarantine whatever this scan says.
            let bytes = self
                .storage
                .download(StorageArea::Quarantine, key)
                .await
                .map_err(|e| PipelineError::storage("download", e))?;
            let scan = self
                .scanner
                .scan(&bytes, self.display_name(document))
                .await
                .map_err(|e| PipelineError::capability("malware scan", e))?;
            if !scan.is_infected {
                tracing::warn!(key = %key, "Quarantined object rescanned clean, keeping it quarantined");
            }

            let metadata = json!({
                "scan": {
                    "isInfected": true,
                    "viruses": scan.viruses,
                    "scannedAt": scan.scan_time.to_rfc3339_opts(SecondsFormat::Millis, true),
                },
                "processing": { "resumed_from": "quarantine" },
            });
            self.finish(document, UploadStatus::InQuarantine, metadata, None)
                .await?;
            return Ok(ProcessingOutcome {
                document_id: document.id,
                upload_status: UploadStatus::InQuarantine,
                signed_url: None,
                is_quarantined: true,
                viruses: scan.viruses,
            });
        }

        Err(PipelineError::storage(
            "download",
            anyhow::anyhow!(
                "object {} is missing from staging, production and quarantine",
                key
            ),
        )
        .into())
    }

    async fn finish_uploaded(
        &self,
        document: &Document,
        mut metadata: Value,
        processing: Map<String, Value>,
        size: usize,
    ) -> Result<ProcessingOutcome, JobError> {
        if !processing.is_empty() {
            merge_metadata(&mut metadata, json!({ "processing": processing }));
        }
        self.finish(document, UploadStatus::Uploaded, metadata, Some(size as i64))
            .await?;

        let signed_url = match self
            .storage
            .signed_url(StorageArea::Production, &document.path, self.signed_url_ttl)
            .await
        {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(error = %e, "Document uploaded but signing its URL failed");
                None
            }
        };

        Ok(ProcessingOutcome {
            document_id: document.id,
            upload_status: UploadStatus::Uploaded,
            signed_url,
            is_quarantined: false,
            viruses: Vec::new(),
        })
    }

    /// PROCESSING → `status`, or `StateConflict` if the record moved meanwhile.
    async fn finish(
        &self,
        document: &Document,
        status: UploadStatus,
        metadata: Value,
        size: Option<i64>,
    ) -> Result<(), JobError> {
        let mut update = DocumentUpdate::status(status).with_metadata(metadata);
        if let Some(size) = size {
            update = update.with_size(size);
        }

        let applied = self
            .documents
            .update_if_status(document.id, UploadStatus::Processing, update)
            .await
            .with_context(|| format!("Failed to mark document as {}", status))?;
        if applied {
            return Ok(());
        }

        let actual = match self.documents.get(document.id).await {
            Ok(Some(current)) => current.upload_status.to_string(),
            Ok(None) => "deleted".to_string(),
            Err(_) => "unknown".to_string(),
        };
        Err(PipelineError::StateConflict {
            document_id: document.id,
            expected: UploadStatus::Processing,
            actual,
        }
        .into())
    }

    fn display_name<'a>(&self, document: &'a Document) -> &'a str {
        document.original_name.as_deref().unwrap_or(&document.path)
    }
}

fn transcode_capability(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image transcoding",
        MediaKind::Video => "video transcoding",
        MediaKind::Audio => "audio transcoding",
    }
}

#[async_trait]
impl JobHandler for DocumentProcessor {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let payload = job.parse_payload().unrecoverable()?;
        let outcome = self.process(&payload.request).await?;
        Ok(serde_json::to_value(&outcome)?)
    }

    async fn on_exhausted(&self, job: &Job, failure: &JobFailure) -> Result<()> {
        let payload = match job.parse_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "No document to finalize for job");
                return Ok(());
            }
        };
        self.finalize_failure(payload.request.document_id, failure, job.attempts_made)
            .await?;
        Ok(())
    }
}
