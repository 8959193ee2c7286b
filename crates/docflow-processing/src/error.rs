use thiserror::Error;

/// Failures of a transcoder or of the external tools it drives.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// ffmpeg ran and exited non-zero; `stderr` keeps the tail of its output
    #[error("ffmpeg exit {}: {stderr}", exit_label(.code))]
    Ffmpeg { code: Option<i32>, stderr: String },

    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: &'static str, secs: u64 },

    #[error("Failed to start {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid tool path: {0}")]
    InvalidPath(String),

    #[error("Image transcoding failed: {0}")]
    Image(String),

    #[error("Transcoding task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

/// Metadata extraction failures.
///
/// `Content` means the bytes could not be understood; the extractor records
/// it in the metadata bag instead of failing. Every other variant means an
/// external tool could not be run and surfaces to the caller.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("{0}")]
    Content(String),

    #[error("Failed to start {tool}: {source}")]
    ToolUnavailable {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: &'static str, secs: u64 },

    #[error("Invalid tool path: {0}")]
    InvalidPath(String),

    #[error("IO error during metadata extraction: {0}")]
    Io(#[from] std::io::Error),
}

impl MetadataError {
    pub fn content(message: impl std::fmt::Display) -> Self {
        MetadataError::Content(message.to_string())
    }
}
