//! Shared fixtures: in-memory stores plus scripted capability services.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use docflow_core::models::{Document, MediaKind, ScanResult, UploadStatus};
use docflow_db::{MemoryDocumentStore, MemoryJobStore};
use docflow_processing::{
    MetadataError, MetadataExtractor, TranscodeError, TranscodeOutput, Transcoder, Transcoders,
};
use docflow_services::{MalwareScanner, ScanError};
use docflow_storage::{MemoryStorage, StorageArea};
use docflow_worker::DocumentProcessor;

pub const EICAR: &str = "Eicar-Test-Signature";

#[derive(Clone)]
pub enum ScanBehavior {
    Clean,
    Infected(Vec<String>),
    Unavailable,
    /// Another writer moves the document to the given status while the scan runs
    Interfere(MemoryDocumentStore, Uuid, UploadStatus),
}

pub struct ScriptedScanner {
    behavior: ScanBehavior,
    pub calls: AtomicUsize,
}

impl ScriptedScanner {
    pub fn new(behavior: ScanBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MalwareScanner for ScriptedScanner {
    async fn scan(&self, _data: &[u8], filename: &str) -> Result<ScanResult, ScanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            ScanBehavior::Clean => Ok(ScanResult::clean()),
            ScanBehavior::Infected(viruses) => Ok(ScanResult::infected(viruses.clone())),
            ScanBehavior::Unavailable => Err(ScanError::Unavailable(format!(
                "clamd refused connection while scanning {}",
                filename
            ))),
            ScanBehavior::Interfere(documents, id, status) => {
                documents.force_status(*id, *status);
                Ok(ScanResult::clean())
            }
        }
    }
}

/// Keeps the first half of the bytes and records the level it was given.
pub struct HalvingTranscoder {
    kind: MediaKind,
    pub levels: Mutex<Vec<u8>>,
}

impl HalvingTranscoder {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            levels: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Transcoder for HalvingTranscoder {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn transcode(
        &self,
        _document: &Document,
        data: Bytes,
        level: u8,
    ) -> Result<TranscodeOutput, TranscodeError> {
        self.levels.lock().unwrap().push(level);
        Ok(TranscodeOutput::Rewritten {
            bytes: data.slice(..data.len() / 2),
            processing: json!({
                "compression": { "level": level, "originalSize": data.len(), "outputSize": data.len() / 2 }
            }),
        })
    }
}

/// Reports the base fields the real extractor would, plus a fixed kind.
pub struct StubExtractor;

#[async_trait]
impl MetadataExtractor for StubExtractor {
    async fn extract(&self, document: &Document, data: &[u8]) -> Result<Value, MetadataError> {
        Ok(json!({
            "kind": "stub",
            "mimeType": document.mime_type,
            "originalName": document.original_name,
            "size": data.len(),
        }))
    }
}

pub struct Harness {
    pub documents: MemoryDocumentStore,
    pub jobs: MemoryJobStore,
    pub storage: MemoryStorage,
    pub scanner: Arc<ScriptedScanner>,
    pub image_transcoder: Arc<HalvingTranscoder>,
    pub processor: Arc<DocumentProcessor>,
}

impl Harness {
    pub fn new(behavior: ScanBehavior) -> Self {
        Self::with_documents(MemoryDocumentStore::new(), behavior)
    }

    /// Use when the scan behavior needs a handle on the same document store.
    pub fn with_documents(documents: MemoryDocumentStore, behavior: ScanBehavior) -> Self {
        let storage = MemoryStorage::new();
        let scanner = Arc::new(ScriptedScanner::new(behavior));
        let image_transcoder = Arc::new(HalvingTranscoder::new(MediaKind::Image));
        let transcoders = Transcoders::new().with(image_transcoder.clone());

        let processor = DocumentProcessor::new(
            Arc::new(documents.clone()),
            Arc::new(storage.clone()),
            scanner.clone(),
            transcoders,
            Arc::new(StubExtractor),
        )
        .with_signed_url_ttl(Duration::from_secs(600));

        Self {
            documents,
            jobs: MemoryJobStore::new(),
            storage,
            scanner,
            image_transcoder,
            processor: Arc::new(processor),
        }
    }

    /// Insert a STAGING document whose bytes sit in the staging area.
    pub fn stage(&self, mime: &str, name: &str, bytes: &'static [u8]) -> Document {
        let document = document(mime, name, UploadStatus::Staging);
        self.place(&document, StorageArea::Staging, bytes);
        document
    }

    /// Insert `document` as is, with its bytes in `area`.
    pub fn place(&self, document: &Document, area: StorageArea, bytes: &'static [u8]) {
        self.storage
            .put(area, &document.path, Bytes::from_static(bytes));
        self.documents.insert(document.clone());
    }

    pub fn status(&self, id: Uuid) -> UploadStatus {
        self.documents.snapshot(id).unwrap().upload_status
    }

    pub fn metadata(&self, id: Uuid) -> Value {
        self.documents
            .snapshot(id)
            .unwrap()
            .metadata
            .unwrap_or(Value::Null)
    }
}

pub fn document(mime: &str, name: &str, status: UploadStatus) -> Document {
    let id = Uuid::new_v4();
    Document {
        id,
        path: format!("uploads/{}/{}", id, name),
        mime_type: Some(mime.to_string()),
        original_name: Some(name.to_string()),
        size: None,
        upload_status: status,
        metadata: None,
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
