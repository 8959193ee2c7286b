#[cfg(feature = "storage-local")]
use crate::LocalAreaStorage;
#[cfg(feature = "storage-s3")]
use crate::S3AreaStorage;
use crate::{AreaBuckets, AreaStorage, StorageBackend, StorageError, StorageResult};
use docflow_core::StorageConfig;
use std::sync::Arc;

/// Create a storage backend based on configuration
pub async fn create_storage(config: &StorageConfig) -> StorageResult<Arc<dyn AreaStorage>> {
    let buckets = AreaBuckets::from(config);

    match config.backend {
        #[cfg(feature = "storage-s3")]
        StorageBackend::S3 => {
            let storage = S3AreaStorage::new(&config.s3, buckets).await?;
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-s3"))]
        StorageBackend::S3 => Err(StorageError::ConfigError(
            "S3 storage backend not available (storage-s3 feature not enabled)".to_string(),
        )),

        #[cfg(feature = "storage-local")]
        StorageBackend::Local => {
            if config.local_path.trim().is_empty() {
                return Err(StorageError::ConfigError(
                    "LOCAL_STORAGE_PATH not configured".to_string(),
                ));
            }
            let storage = LocalAreaStorage::new(&config.local_path, buckets).await?;
            tracing::info!(path = %config.local_path, "Using local area storage");
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-local"))]
        StorageBackend::Local => Err(StorageError::ConfigError(
            "Local storage backend not available (storage-local feature not enabled)".to_string(),
        )),
    }
}
