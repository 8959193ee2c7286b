use async_trait::async_trait;
use bytes::Bytes;
use docflow_core::models::{Document, MediaKind};
use serde_json::json;
use std::sync::Arc;

use super::{TranscodeOutput, Transcoder};
use crate::error::TranscodeError;
use crate::ffmpeg::FfmpegRunner;
use crate::level::{clamp_level, crf_from_level};

/// Recompresses MP4-family and WebM videos with ffmpeg at a level-derived
/// constant rate factor. The container is kept.
pub struct VideoTranscoder {
    runner: Arc<FfmpegRunner>,
}

impl VideoTranscoder {
    pub fn new(runner: Arc<FfmpegRunner>) -> Self {
        Self { runner }
    }

    /// ffmpeg output arguments for `ext`, or None when the container is not
    /// recompressed.
    pub fn ffmpeg_args(ext: &str, crf: u8) -> Option<Vec<String>> {
        let crf = crf.to_string();
        let args: Vec<&str> = match ext {
            ".mp4" | ".m4v" | ".mov" => vec![
                "-c:v", "libx264", "-preset", "medium", "-crf", crf.as_str(), "-c:a", "aac", "-b:a",
                "128k", "-movflags", "+faststart",
            ],
            ".webm" => vec![
                "-c:v", "libvpx-vp9", "-crf", crf.as_str(), "-b:v", "0", "-c:a", "libopus", "-b:a", "96k",
            ],
            _ => return None,
        };
        Some(args.into_iter().map(String::from).collect())
    }
}

#[async_trait]
impl Transcoder for VideoTranscoder {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    #[tracing::instrument(skip(self, document, data), fields(document_id = %document.id, size_bytes = data.len()))]
    async fn transcode(
        &self,
        document: &Document,
        data: Bytes,
        level: u8,
    ) -> Result<TranscodeOutput, TranscodeError> {
        let level = clamp_level(level);
        let crf = crf_from_level(level);
        let ext = document.extension();

        let Some(args) = Self::ffmpeg_args(&ext, crf) else {
            tracing::debug!(extension = %ext, "Video container not recompressed");
            return Ok(TranscodeOutput::skipped("unsupported_ext"));
        };

        let bytes = self.runner.transcode_buffer(&data, &ext, &ext, &args).await?;

        tracing::info!(
            extension = %ext,
            crf = crf,
            original_size = data.len(),
            output_size = bytes.len(),
            "Video recompressed"
        );

        Ok(TranscodeOutput::Rewritten {
            bytes,
            processing: json!({ "compression": { "level": level, "crf": crf } }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::models::UploadStatus;
    use std::time::Duration;
    use uuid::Uuid;

    fn document(name: &str) -> Document {
        Document {
            id: Uuid::new_v4(),
            path: format!("uploads/{}", name),
            mime_type: Some("video/mp4".into()),
            original_name: Some(name.into()),
            size: None,
            upload_status: UploadStatus::Processing,
            metadata: None,
        }
    }

    fn transcoder(ffmpeg: &str) -> VideoTranscoder {
        VideoTranscoder::new(Arc::new(
            FfmpegRunner::new(ffmpeg, Duration::from_secs(5)).unwrap(),
        ))
    }

    #[test]
    fn mp4_and_webm_arguments() {
        let mp4 = VideoTranscoder::ffmpeg_args(".mp4", 21).unwrap();
        assert_eq!(
            mp4.join(" "),
            "-c:v libx264 -preset medium -crf 21 -c:a aac -b:a 128k -movflags +faststart"
        );
        let webm = VideoTranscoder::ffmpeg_args(".webm", 30).unwrap();
        assert_eq!(
            webm.join(" "),
            "-c:v libvpx-vp9 -crf 30 -b:v 0 -c:a libopus -b:a 96k"
        );
        assert!(VideoTranscoder::ffmpeg_args(".avi", 21).is_none());
        assert!(VideoTranscoder::ffmpeg_args("", 21).is_none());
    }

    #[tokio::test]
    async fn unsupported_container_is_skipped_without_running_ffmpeg() {
        let out = transcoder("/nonexistent/ffmpeg")
            .transcode(&document("clip.avi"), Bytes::from_static(b"RIFF"), 80)
            .await
            .unwrap();
        assert_eq!(out, TranscodeOutput::skipped("unsupported_ext"));
    }

    #[tokio::test]
    async fn ffmpeg_failure_propagates() {
        let err = transcoder("/nonexistent/ffmpeg")
            .transcode(&document("clip.MP4"), Bytes::from_static(b"data"), 80)
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Spawn { .. }));
    }
}
