//! Audio and video metadata via ffprobe.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::MetadataError;
use crate::ffmpeg::validate_tool_path;

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    channels: Option<i32>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Audio/video fields. `width` and `height` are only reported for video.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvMetadata {
    pub kind: &'static str,
    pub duration_seconds: Option<f64>,
    pub container: Option<String>,
    pub codec: Option<String>,
    pub bitrate: Option<u64>,
    pub sample_rate: Option<u32>,
    pub number_of_channels: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl AvMetadata {
    fn from_probe(probe: FfprobeOutput, is_video: bool) -> Self {
        let streams = probe.streams.unwrap_or_default();
        let find = |kind: &str| {
            streams
                .iter()
                .find(|s| s.codec_type.as_deref() == Some(kind))
        };
        let video = find("video");
        let audio = find("audio");
        let primary = if is_video { video.or(audio) } else { audio };

        let format = probe.format;
        Self {
            kind: if is_video { "video" } else { "audio" },
            duration_seconds: format
                .as_ref()
                .and_then(|f| f.duration.as_deref())
                .and_then(|d| d.parse::<f64>().ok()),
            container: format.as_ref().and_then(|f| f.format_name.clone()),
            codec: primary.and_then(|s| s.codec_name.clone()),
            bitrate: format
                .as_ref()
                .and_then(|f| f.bit_rate.as_deref())
                .and_then(|b| b.parse::<u64>().ok()),
            sample_rate: audio
                .and_then(|s| s.sample_rate.as_deref())
                .and_then(|r| r.parse::<u32>().ok()),
            number_of_channels: audio.and_then(|s| s.channels),
            width: if is_video { video.and_then(|s| s.width) } else { None },
            height: if is_video { video.and_then(|s| s.height) } else { None },
        }
    }
}

pub struct Ffprobe {
    ffprobe_path: String,
    timeout: Duration,
}

impl Ffprobe {
    pub fn new(ffprobe_path: impl Into<String>, timeout: Duration) -> Result<Self, MetadataError> {
        let ffprobe_path = ffprobe_path.into();
        validate_tool_path(&ffprobe_path).map_err(MetadataError::InvalidPath)?;
        Ok(Self {
            ffprobe_path,
            timeout,
        })
    }

    /// Probe `data` through a temp file named with `ext` so ffprobe can use
    /// the extension as a format hint.
    #[tracing::instrument(skip(self, data), fields(size_bytes = data.len()))]
    pub async fn extract(
        &self,
        data: &[u8],
        ext: &str,
        is_video: bool,
    ) -> Result<AvMetadata, MetadataError> {
        let file = tempfile::Builder::new()
            .prefix("docflow-probe-")
            .suffix(ext)
            .tempfile()?;
        tokio::fs::write(file.path(), data).await?;

        let child = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MetadataError::ToolUnavailable {
                tool: "ffprobe",
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| MetadataError::Timeout {
                tool: "ffprobe",
                secs: self.timeout.as_secs(),
            })??;

        if !output.status.success() {
            return Err(MetadataError::Content(format!(
                "ffprobe could not read the file (exit {:?})",
                output.status.code()
            )));
        }

        let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| MetadataError::content(format!("Failed to parse ffprobe output: {}", e)))?;

        Ok(AvMetadata::from_probe(probe, is_video))
    }
}
