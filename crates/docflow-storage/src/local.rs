use crate::keys::validate_key;
use crate::traits::{AreaBuckets, AreaStorage, StorageArea, StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Local filesystem storage: one directory per area under `base_path`.
///
/// Meant for development; "signed" URLs are `file://` URLs carrying an
/// `expires` timestamp that nothing enforces.
#[derive(Clone)]
pub struct LocalAreaStorage {
    base_path: PathBuf,
    buckets: AreaBuckets,
}

impl LocalAreaStorage {
    pub async fn new(base_path: impl Into<PathBuf>, buckets: AreaBuckets) -> StorageResult<Self> {
        let base_path = base_path.into();

        for area in StorageArea::ALL {
            let dir = base_path.join(buckets.bucket(area));
            fs::create_dir_all(&dir).await.map_err(|e| {
                StorageError::ConfigError(format!(
                    "Failed to create storage directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let base_path = base_path.canonicalize().map_err(|e| {
            StorageError::ConfigError(format!("Failed to canonicalize base path: {}", e))
        })?;

        Ok(Self { base_path, buckets })
    }

    fn key_to_path(&self, area: StorageArea, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.base_path.join(self.buckets.bucket(area)).join(key))
    }

    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AreaStorage for LocalAreaStorage {
    async fn upload(
        &self,
        area: StorageArea,
        key: &str,
        data: Bytes,
        _content_type: Option<&str>,
    ) -> StorageResult<()> {
        let path = self.key_to_path(area, key)?;
        self.ensure_parent_dir(&path).await?;

        // Write beside the target and rename so readers never see a partial file.
        let tmp = path.with_extension(format!("tmp-{}", tmp_suffix()));
        let mut file = fs::File::create(&tmp).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to create file {}: {}", tmp.display(), e))
        })?;
        file.write_all(&data).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to write file {}: {}", tmp.display(), e))
        })?;
        file.sync_all().await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to sync file {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to move file {}: {}", path.display(), e))
        })?;

        tracing::debug!(area = %area, key = %key, size_bytes = data.len(), "Local upload successful");
        Ok(())
    }

    async fn download(&self, area: StorageArea, key: &str) -> StorageResult<Bytes> {
        let path = self.key_to_path(area, key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(format!("{}/{}", area, key)))
            }
            Err(e) => Err(StorageError::DownloadFailed(format!(
                "Failed to read file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn delete(&self, area: StorageArea, key: &str) -> StorageResult<()> {
        let path = self.key_to_path(area, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::DeleteFailed(format!(
                "Failed to delete file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn copy_between_areas(
        &self,
        src: StorageArea,
        dst: StorageArea,
        key: &str,
    ) -> StorageResult<()> {
        let from = self.key_to_path(src, key)?;
        let to = self.key_to_path(dst, key)?;
        self.ensure_parent_dir(&to).await?;
        match fs::copy(&from, &to).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(format!("{}/{}", src, key)))
            }
            Err(e) => Err(StorageError::CopyFailed(format!(
                "Failed to copy {} to {}: {}",
                from.display(),
                to.display(),
                e
            ))),
        }
    }

    async fn signed_url(
        &self,
        area: StorageArea,
        key: &str,
        ttl: Duration,
    ) -> StorageResult<String> {
        let path = self.key_to_path(area, key)?;
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("file://{}?expires={}", path.display(), expires))
    }

    async fn exists(&self, area: StorageArea, key: &str) -> StorageResult<bool> {
        let path = self.key_to_path(area, key)?;
        Ok(fs::try_exists(&path).await?)
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

fn tmp_suffix() -> String {
    format!("{:x}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}
