//! "Document uploaded" event payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use validator::Validate;

pub const DEFAULT_COMPRESSION_LEVEL: i64 = 80;

/// Compression level: 99 = best quality, 1 = most compressed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate, PartialEq, Eq)]
pub struct CompressionOptions {
    #[validate(range(min = 1, max = 99))]
    pub level: i64,
}

impl CompressionOptions {
    /// Level clamped into 1..=99.
    pub fn clamped_level(&self) -> u8 {
        self.level.clamp(1, 99) as u8
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, PartialEq)]
pub struct MediaProcessingOptions {
    #[validate(nested)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionOptions>,
}

/// Placeholder options for document kinds; carried through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocProcessingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ProcessDocumentRequest {
    pub document_id: Uuid,
    #[validate(nested)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_processing_opts: Option<MediaProcessingOptions>,
    #[validate(nested)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_processing_opts: Option<MediaProcessingOptions>,
    #[validate(nested)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_processing_opts: Option<MediaProcessingOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_processing_opts: Option<DocProcessingOptions>,
}

impl ProcessDocumentRequest {
    pub fn new(document_id: Uuid) -> Self {
        Self {
            document_id,
            image_processing_opts: None,
            video_processing_opts: None,
            audio_processing_opts: None,
            doc_processing_opts: None,
        }
    }

    /// Compression options supplied for `kind`, if any.
    pub fn compression_for(&self, kind: MediaKind) -> Option<CompressionOptions> {
        let opts = match kind {
            MediaKind::Image => self.image_processing_opts.as_ref(),
            MediaKind::Video => self.video_processing_opts.as_ref(),
            MediaKind::Audio => self.audio_processing_opts.as_ref(),
        };
        opts.and_then(|o| o.compression)
    }
}

/// Media kinds that have a transcoder, selected by MIME prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("image/") {
            Some(MediaKind::Image)
        } else if mime.starts_with("video/") {
            Some(MediaKind::Video)
        } else if mime.starts_with("audio/") {
            Some(MediaKind::Audio)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}
