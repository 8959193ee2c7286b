//! Storage abstraction trait
//!
//! This module defines the area-aware storage contract the worker drives
//! documents through.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::time::Duration;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("Copy failed: {0}")]
    CopyFailed(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Named storage areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageArea {
    /// Uploaded bytes that have not been validated yet
    Staging,
    /// Validated, servable bytes
    Production,
    /// Infected bytes kept for audit
    Quarantine,
    /// Bytes of documents whose processing failed for good
    Failed,
}

impl StorageArea {
    pub const ALL: [StorageArea; 4] = [
        StorageArea::Staging,
        StorageArea::Production,
        StorageArea::Quarantine,
        StorageArea::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageArea::Staging => "staging",
            StorageArea::Production => "production",
            StorageArea::Quarantine => "quarantine",
            StorageArea::Failed => "failed",
        }
    }
}

impl Display for StorageArea {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Bucket name of every area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaBuckets {
    pub staging: String,
    pub production: String,
    pub quarantine: String,
    pub failed: String,
}

impl AreaBuckets {
    pub fn bucket(&self, area: StorageArea) -> &str {
        match area {
            StorageArea::Staging => &self.staging,
            StorageArea::Production => &self.production,
            StorageArea::Quarantine => &self.quarantine,
            StorageArea::Failed => &self.failed,
        }
    }
}

impl From<&docflow_core::StorageConfig> for AreaBuckets {
    fn from(config: &docflow_core::StorageConfig) -> Self {
        Self {
            staging: config.staging_bucket.clone(),
            production: config.production_bucket.clone(),
            quarantine: config.quarantine_bucket.clone(),
            failed: config.failed_bucket.clone(),
        }
    }
}

/// Area-aware storage abstraction
///
/// All backends (S3, local filesystem, memory) implement this trait. Keys are
/// identical across areas.
#[async_trait]
pub trait AreaStorage: Send + Sync {
    /// Store `data` under `key` in `area`, replacing any existing object.
    async fn upload(
        &self,
        area: StorageArea,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> StorageResult<()>;

    /// Fetch an object; a missing object is [`StorageError::NotFound`].
    async fn download(&self, area: StorageArea, key: &str) -> StorageResult<Bytes>;

    /// Remove an object. Deleting a missing object succeeds.
    async fn delete(&self, area: StorageArea, key: &str) -> StorageResult<()>;

    /// Server-side copy of `key` from `src` to `dst`; the source is kept.
    async fn copy_between_areas(
        &self,
        src: StorageArea,
        dst: StorageArea,
        key: &str,
    ) -> StorageResult<()>;

    /// Time-limited URL granting read access to an object.
    async fn signed_url(&self, area: StorageArea, key: &str, ttl: Duration)
        -> StorageResult<String>;

    async fn exists(&self, area: StorageArea, key: &str) -> StorageResult<bool>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Copy to `dst`, then delete from `src`. Never deletes first.
    async fn move_between_areas(
        &self,
        src: StorageArea,
        dst: StorageArea,
        key: &str,
    ) -> StorageResult<()> {
        self.copy_between_areas(src, dst, key).await?;
        self.delete(src, key).await?;
        tracing::info!(
            backend = self.backend_name(),
            from = %src,
            to = %dst,
            key = %key,
            "Object moved between areas"
        );
        Ok(())
    }
}
