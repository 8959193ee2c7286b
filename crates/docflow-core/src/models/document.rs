use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a document inside the pipeline.
///
/// Only STAGING → PROCESSING → {UPLOADED, IN_QUARANTINE, FAILED} is allowed;
/// the last three are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Staging,
    Processing,
    Uploaded,
    Failed,
    InQuarantine,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Staging => "STAGING",
            UploadStatus::Processing => "PROCESSING",
            UploadStatus::Uploaded => "UPLOADED",
            UploadStatus::Failed => "FAILED",
            UploadStatus::InQuarantine => "IN_QUARANTINE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Uploaded | UploadStatus::Failed | UploadStatus::InQuarantine
        )
    }

    /// STAGING and PROCESSING may be picked up by a worker; PROCESSING is
    /// re-entrant so a retried job resumes a crashed attempt.
    pub fn is_processable(&self) -> bool {
        matches!(self, UploadStatus::Staging | UploadStatus::Processing)
    }
}

impl Display for UploadStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STAGING" => Ok(UploadStatus::Staging),
            "PROCESSING" => Ok(UploadStatus::Processing),
            "UPLOADED" => Ok(UploadStatus::Uploaded),
            "FAILED" => Ok(UploadStatus::Failed),
            "IN_QUARANTINE" => Ok(UploadStatus::InQuarantine),
            _ => Err(anyhow::anyhow!("Invalid upload status: {}", s)),
        }
    }
}

/// The fields of a document record the pipeline reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Document {
    pub id: Uuid,
    /// Storage key, identical in every area
    pub path: String,
    pub mime_type: Option<String>,
    pub original_name: Option<String>,
    pub size: Option<i64>,
    pub upload_status: UploadStatus,
    pub metadata: Option<Value>,
}

impl Document {
    pub fn mime(&self) -> String {
        self.mime_type.as_deref().unwrap_or_default().to_lowercase()
    }

    /// Lowercased extension of the original file name, with the leading dot.
    pub fn extension(&self) -> String {
        self.original_name
            .as_deref()
            .and_then(|name| std::path::Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_lowercase()))
            .unwrap_or_default()
    }
}

/// Partial update applied under a status precondition.
///
/// `metadata` is deep-merged into the stored bag, never assigned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentUpdate {
    pub upload_status: Option<UploadStatus>,
    pub metadata: Option<Value>,
    pub size: Option<i64>,
}

impl DocumentUpdate {
    pub fn status(status: UploadStatus) -> Self {
        Self {
            upload_status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = Some(size);
        self
    }
}
