//! Error types module
//!
//! `PipelineError` is the error taxonomy of the processing pipeline. Each
//! variant self-describes whether the job queue should retry it through the
//! [`ErrorMetadata`] trait, so the worker never needs to match on variants to
//! decide the retry policy.

use std::fmt::{Display, Formatter, Result as FmtResult};

use uuid::Uuid;

use crate::models::UploadStatus;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Expected outcomes such as redelivered or ineligible documents
    Debug,
    /// Recoverable issues that will be retried
    Warn,
    /// Unexpected failures
    Error,
}

/// Metadata describing how an error should be handled and reported.
pub trait ErrorMetadata {
    /// Machine-readable error code (e.g., "DOCUMENT_NOT_FOUND")
    fn error_code(&self) -> &'static str;

    /// Whether the failed operation may succeed if retried
    fn is_recoverable(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

/// Which stage rejected a poison message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonKind {
    /// The payload was not valid JSON
    Parse,
    /// The payload was JSON but did not match the event schema
    Schema,
}

impl Display for PoisonKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            PoisonKind::Parse => write!(f, "parse"),
            PoisonKind::Schema => write!(f, "schema"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Poison message ({kind}) on {topic}[{partition}]@{offset}: {reason}")]
    PoisonMessage {
        kind: PoisonKind,
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    #[error("Document not found: {0}")]
    NotFound(Uuid),

    #[error("Document {document_id} cannot be processed from status {status}")]
    IneligibleState {
        document_id: Uuid,
        status: UploadStatus,
    },

    #[error("Document {document_id} left {expected} concurrently (now {actual})")]
    StateConflict {
        document_id: Uuid,
        expected: UploadStatus,
        actual: String,
    },

    #[error("{capability} failed")]
    Capability {
        capability: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Storage {operation} failed")]
    Storage {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Retries exhausted after {attempts} attempt(s): {message}")]
    ExhaustedRetries { attempts: i32, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn capability(capability: &'static str, source: impl Into<anyhow::Error>) -> Self {
        PipelineError::Capability {
            capability,
            source: source.into(),
        }
    }

    pub fn storage(operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        PipelineError::Storage {
            operation,
            source: source.into(),
        }
    }
}

impl ErrorMetadata for PipelineError {
    fn error_code(&self) -> &'static str {
        match self {
            PipelineError::PoisonMessage { .. } => "POISON_MESSAGE",
            PipelineError::NotFound(_) => "DOCUMENT_NOT_FOUND",
            PipelineError::IneligibleState { .. } => "INELIGIBLE_STATE",
            PipelineError::StateConflict { .. } => "STATE_CONFLICT",
            PipelineError::Capability { .. } => "CAPABILITY_FAILURE",
            PipelineError::Storage { .. } => "STORAGE_FAILURE",
            PipelineError::ExhaustedRetries { .. } => "EXHAUSTED_RETRIES",
            PipelineError::Config(_) => "CONFIG_ERROR",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Capability { .. } | PipelineError::Storage { .. }
        )
    }

    fn log_level(&self) -> LogLevel {
        match self {
            PipelineError::IneligibleState { .. } | PipelineError::StateConflict { .. } => {
                LogLevel::Debug
            }
            PipelineError::Capability { .. } | PipelineError::Storage { .. } => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_and_storage_failures_are_recoverable() {
        let cap = PipelineError::capability("scanner", anyhow::anyhow!("clamd down"));
        let sto = PipelineError::storage("download", anyhow::anyhow!("timeout"));
        assert!(cap.is_recoverable());
        assert!(sto.is_recoverable());
        assert_eq!(cap.error_code(), "CAPABILITY_FAILURE");
        assert_eq!(sto.error_code(), "STORAGE_FAILURE");
    }

    #[test]
    fn document_state_errors_are_not_recoverable() {
        let id = Uuid::new_v4();
        assert!(!PipelineError::NotFound(id).is_recoverable());
        let ineligible = PipelineError::IneligibleState {
            document_id: id,
            status: UploadStatus::Uploaded,
        };
        assert!(!ineligible.is_recoverable());
        assert_eq!(ineligible.log_level(), LogLevel::Debug);
        assert!(ineligible.to_string().contains("UPLOADED"));
    }

    #[test]
    fn poison_message_display_includes_provenance() {
        let err = PipelineError::PoisonMessage {
            kind: PoisonKind::Schema,
            topic: "document.uploaded".into(),
            partition: 2,
            offset: 41,
            reason: "document_id: missing".into(),
        };
        let text = err.to_string();
        assert!(text.contains("schema"));
        assert!(text.contains("document.uploaded[2]@41"));
    }
}
