//! Per-kind transcoders.
//!
//! A transcoder either leaves the bytes alone (`Unchanged`) or returns the
//! recompressed bytes (`Rewritten`). Both carry the `processing` block that
//! the worker merges into the document metadata under the media kind.

#[cfg(feature = "audio")]
mod audio;
#[cfg(feature = "image")]
mod image;
#[cfg(feature = "video")]
mod video;

#[cfg(feature = "audio")]
pub use self::audio::AudioTranscoder;
#[cfg(feature = "image")]
pub use self::image::ImageTranscoder;
#[cfg(feature = "video")]
pub use self::video::VideoTranscoder;

use async_trait::async_trait;
use bytes::Bytes;
use docflow_core::models::{Document, MediaKind};
use docflow_core::ProcessingConfig;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TranscodeError;

#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeOutput {
    Unchanged { processing: Value },
    Rewritten { bytes: Bytes, processing: Value },
}

impl TranscodeOutput {
    /// Unchanged output recording why the transcoder did nothing.
    pub fn skipped(reason: &str) -> Self {
        TranscodeOutput::Unchanged {
            processing: json!({ "compression": { "skipped": true, "reason": reason } }),
        }
    }

    pub fn processing(&self) -> &Value {
        match self {
            TranscodeOutput::Unchanged { processing } => processing,
            TranscodeOutput::Rewritten { processing, .. } => processing,
        }
    }

    pub fn is_rewritten(&self) -> bool {
        matches!(self, TranscodeOutput::Rewritten { .. })
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// The media kind this transcoder is selected for.
    fn kind(&self) -> MediaKind;

    /// Recompress `data` at `level` (1..=99).
    async fn transcode(
        &self,
        document: &Document,
        data: Bytes,
        level: u8,
    ) -> Result<TranscodeOutput, TranscodeError>;
}

/// The transcoders available to the worker, at most one per media kind.
#[derive(Clone, Default)]
pub struct Transcoders {
    by_kind: HashMap<MediaKind, Arc<dyn Transcoder>>,
}

impl Transcoders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transcoder` for its kind, replacing any previous one.
    pub fn with(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.by_kind.insert(transcoder.kind(), transcoder);
        self
    }

    /// Every transcoder enabled at compile time.
    pub fn from_config(config: &ProcessingConfig) -> Result<Self, TranscodeError> {
        #[allow(unused_mut)]
        let mut transcoders = Self::new();

        #[cfg(feature = "image")]
        {
            transcoders = transcoders.with(Arc::new(ImageTranscoder::new()));
        }

        #[cfg(any(feature = "video", feature = "audio"))]
        {
            let runner = Arc::new(crate::ffmpeg::FfmpegRunner::new(
                config.ffmpeg_path.clone(),
                std::time::Duration::from_secs(config.transcode_timeout_secs),
            )?);
            #[cfg(feature = "video")]
            {
                transcoders = transcoders.with(Arc::new(VideoTranscoder::new(runner.clone())));
            }
            #[cfg(feature = "audio")]
            {
                transcoders = transcoders.with(Arc::new(AudioTranscoder::new(runner)));
            }
        }

        #[cfg(not(any(feature = "video", feature = "audio")))]
        let _ = config;

        Ok(transcoders)
    }

    pub fn for_kind(&self, kind: MediaKind) -> Option<Arc<dyn Transcoder>> {
        self.by_kind.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds: Vec<MediaKind> = self.by_kind.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}
