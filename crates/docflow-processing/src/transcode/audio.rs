use async_trait::async_trait;
use bytes::Bytes;
use docflow_core::models::{Document, MediaKind};
use serde_json::json;
use std::sync::Arc;

use super::{TranscodeOutput, Transcoder};
use crate::error::TranscodeError;
use crate::ffmpeg::FfmpegRunner;
use crate::level::{audio_kbps_from_level, clamp_level};

/// Re-encodes MP3, AAC/M4A and Ogg/Opus audio at a level-derived bitrate.
pub struct AudioTranscoder {
    runner: Arc<FfmpegRunner>,
}

impl AudioTranscoder {
    pub fn new(runner: Arc<FfmpegRunner>) -> Self {
        Self { runner }
    }

    fn codec_for(ext: &str) -> Option<&'static str> {
        match ext {
            ".mp3" => Some("libmp3lame"),
            ".m4a" | ".aac" => Some("aac"),
            ".ogg" | ".opus" => Some("libopus"),
            _ => None,
        }
    }

    pub fn ffmpeg_args(ext: &str, kbps: u32) -> Option<Vec<String>> {
        let codec = Self::codec_for(ext)?;
        Some(vec![
            "-vn".to_string(),
            "-c:a".to_string(),
            codec.to_string(),
            "-b:a".to_string(),
            format!("{}k", kbps),
        ])
    }
}

#[async_trait]
impl Transcoder for AudioTranscoder {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    #[tracing::instrument(skip(self, document, data), fields(document_id = %document.id, size_bytes = data.len()))]
    async fn transcode(
        &self,
        document: &Document,
        data: Bytes,
        level: u8,
    ) -> Result<TranscodeOutput, TranscodeError> {
        let level = clamp_level(level);
        let kbps = audio_kbps_from_level(level);
        let ext = document.extension();

        let Some(args) = Self::ffmpeg_args(&ext, kbps) else {
            tracing::debug!(extension = %ext, "Audio format not recompressed");
            return Ok(TranscodeOutput::skipped("unsupported_ext"));
        };

        let bytes = self.runner.transcode_buffer(&data, &ext, &ext, &args).await?;

        tracing::info!(
            extension = %ext,
            bitrate_kbps = kbps,
            original_size = data.len(),
            output_size = bytes.len(),
            "Audio recompressed"
        );

        Ok(TranscodeOutput::Rewritten {
            bytes,
            processing: json!({ "compression": { "level": level, "bitrateKbps": kbps } }),
        })
    }
}
