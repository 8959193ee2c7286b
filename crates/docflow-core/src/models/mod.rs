pub mod document;
pub mod job;
pub mod request;
pub mod scan;

pub use document::{Document, DocumentUpdate, UploadStatus};
pub use job::{Job, JobHandle, JobPayload, JobProvenance, JobStatus, NewJob};
pub use request::{
    CompressionOptions, DocProcessingOptions, MediaKind, MediaProcessingOptions,
    ProcessDocumentRequest, DEFAULT_COMPRESSION_LEVEL,
};
pub use scan::ScanResult;
