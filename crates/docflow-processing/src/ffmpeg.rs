//! ffmpeg subprocess runner used by the video and audio transcoders.

use bytes::Bytes;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::error::TranscodeError;

/// Characters of stderr kept in the error of a failed run.
const STDERR_TAIL_CHARS: usize = 2000;

/// Reject tool paths carrying shell metacharacters or directory traversal.
pub(crate) fn validate_tool_path(path: &str) -> Result<(), String> {
    let dangerous_chars = [';', '|', '&', '$', '`', '(', ')', '<', '>', '\n', '\r'];
    if path.trim().is_empty() {
        return Err("path is empty".to_string());
    }
    if path.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(format!("path contains dangerous characters: {}", path));
    }
    if path.contains("..") {
        return Err(format!("path contains directory traversal: {}", path));
    }
    Ok(())
}

/// Last `max_chars` characters of `text`.
pub(crate) fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

pub struct FfmpegRunner {
    ffmpeg_path: String,
    timeout: Duration,
}

impl FfmpegRunner {
    pub fn new(ffmpeg_path: impl Into<String>, timeout: Duration) -> Result<Self, TranscodeError> {
        let ffmpeg_path = ffmpeg_path.into();
        validate_tool_path(&ffmpeg_path).map_err(TranscodeError::InvalidPath)?;
        Ok(Self {
            ffmpeg_path,
            timeout,
        })
    }

    pub fn ffmpeg_path(&self) -> &str {
        &self.ffmpeg_path
    }

    /// Run `ffmpeg -y -hide_banner -i in{in_ext} <args> out{out_ext}` inside a
    /// private temp directory and return the bytes of the output file.
    ///
    /// The child is killed when the timeout elapses; the temp directory is
    /// removed on every path.
    #[tracing::instrument(skip(self, input, args), fields(size_bytes = input.len()))]
    pub async fn transcode_buffer(
        &self,
        input: &[u8],
        in_ext: &str,
        out_ext: &str,
        args: &[String],
    ) -> Result<Bytes, TranscodeError> {
        let start = Instant::now();
        let dir = tempfile::Builder::new()
            .prefix("docflow-ffmpeg-")
            .tempdir()?;
        let in_path = dir.path().join(format!("in{}", in_ext));
        let out_path = dir.path().join(format!("out{}", out_ext));
        tokio::fs::write(&in_path, input).await?;

        let child = Command::new(&self.ffmpeg_path)
            .arg("-y")
            .arg("-hide_banner")
            .arg("-i")
            .arg(&in_path)
            .args(args)
            .arg(&out_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                tool: "ffmpeg",
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| TranscodeError::Timeout {
                tool: "ffmpeg",
                secs: self.timeout.as_secs(),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = tail(stderr.trim_end(), STDERR_TAIL_CHARS).to_string();
            tracing::warn!(
                code = ?output.status.code(),
                duration_ms = start.elapsed().as_millis() as u64,
                "ffmpeg failed"
            );
            return Err(TranscodeError::Ffmpeg {
                code: output.status.code(),
                stderr,
            });
        }

        let data = tokio::fs::read(&out_path).await?;
        tracing::debug!(
            output_bytes = data.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "ffmpeg finished"
        );
        Ok(Bytes::from(data))
    }
}
