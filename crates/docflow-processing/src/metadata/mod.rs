//! Metadata extraction
//!
//! The extractor picks a parser from the MIME type (falling back to the file
//! extension for office documents) and returns one flat JSON object: the
//! base fields shared by every document plus the fields of its kind.

#[cfg(feature = "document")]
mod document;
#[cfg(feature = "image")]
mod image;
mod media;

#[cfg(feature = "document")]
pub use self::document::{extract_docx, extract_pdf, DocxMetadata, PdfMetadata};
#[cfg(feature = "image")]
pub use self::image::{extract_image, ImageMetadata};
pub use self::media::{AvMetadata, Ffprobe};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docflow_core::models::Document;
use docflow_core::ProcessingConfig;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::MetadataError;

const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const DOC_MIME: &str = "application/msword";
const DOC_WARNING: &str = "Detailed metadata extraction is not supported for binary .doc files";

#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    /// Describe `data`, the final bytes of `document`.
    async fn extract(&self, document: &Document, data: &[u8]) -> Result<Value, MetadataError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BaseMetadata<'a> {
    extracted_at: DateTime<Utc>,
    mime_type: Option<&'a str>,
    original_name: Option<&'a str>,
    size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Image,
    Video,
    Audio,
    Pdf,
    Docx,
    Doc,
    Unknown,
}

impl Family {
    fn of(document: &Document) -> Self {
        let mime = document.mime();
        let ext = document.extension();

        if mime.starts_with("image/") {
            Family::Image
        } else if mime.starts_with("video/") {
            Family::Video
        } else if mime.starts_with("audio/") {
            Family::Audio
        } else if mime == "application/pdf" || ext == ".pdf" {
            Family::Pdf
        } else if mime == DOCX_MIME || ext == ".docx" {
            Family::Docx
        } else if mime == DOC_MIME || ext == ".doc" {
            Family::Doc
        } else {
            Family::Unknown
        }
    }
}

/// Flatten `block` into `base`, keeping explicit nulls.
fn combine(base: Value, block: Value) -> Value {
    match (base, block) {
        (Value::Object(mut base), Value::Object(block)) => {
            base.extend(block);
            Value::Object(base)
        }
        (base, _) => base,
    }
}

fn to_block<T: Serialize>(value: T) -> Result<Value, MetadataError> {
    serde_json::to_value(value).map_err(MetadataError::content)
}

/// The extractor used by the worker: image headers, ffprobe for audio and
/// video, and the PDF/DOCX parsers for office documents.
pub struct DocumentMetadataExtractor {
    ffprobe: Ffprobe,
}

impl DocumentMetadataExtractor {
    pub fn new(ffprobe: Ffprobe) -> Self {
        Self { ffprobe }
    }

    pub fn from_config(config: &ProcessingConfig) -> Result<Self, MetadataError> {
        let ffprobe = Ffprobe::new(
            config.ffprobe_path.clone(),
            Duration::from_secs(config.transcode_timeout_secs),
        )?;
        Ok(Self::new(ffprobe))
    }

    async fn extract_kind(&self, family: Family, document: &Document, data: &[u8]) -> Result<Value, MetadataError> {
        match family {
            #[cfg(feature = "image")]
            Family::Image => to_block(extract_image(data)?),
            #[cfg(not(feature = "image"))]
            Family::Image => Ok(json!({ "kind": "image" })),
            Family::Video => to_block(self.ffprobe.extract(data, &document.extension(), true).await?),
            Family::Audio => to_block(self.ffprobe.extract(data, &document.extension(), false).await?),
            #[cfg(feature = "document")]
            Family::Pdf => to_block(extract_pdf(data)?),
            #[cfg(feature = "document")]
            Family::Docx => to_block(extract_docx(data)?),
            #[cfg(not(feature = "document"))]
            Family::Pdf | Family::Docx => Ok(json!({ "kind": "unknown" })),
            Family::Doc => Ok(json!({
                "kind": "document",
                "format": "doc",
                "pages": null,
                "warning": DOC_WARNING,
            })),
            Family::Unknown => Ok(json!({ "kind": "unknown" })),
        }
    }
}

#[async_trait]
impl MetadataExtractor for DocumentMetadataExtractor {
    #[tracing::instrument(skip(self, document, data), fields(document_id = %document.id, size_bytes = data.len()))]
    async fn extract(&self, document: &Document, data: &[u8]) -> Result<Value, MetadataError> {
        let base = to_block(BaseMetadata {
            extracted_at: Utc::now(),
            mime_type: document.mime_type.as_deref(),
            original_name: document.original_name.as_deref(),
            size: data.len(),
        })?;

        let family = Family::of(document);
        let block = match self.extract_kind(family, document, data).await {
            Ok(block) => block,
            Err(MetadataError::Content(message)) => {
                tracing::warn!(
                    family = ?family,
                    error = %message,
                    "Metadata extraction failed, recording document as unknown"
                );
                json!({ "kind": "unknown", "error": message })
            }
            Err(e) => return Err(e),
        };

        Ok(combine(base, block))
    }
}
