use crate::keys::{copy_source, validate_key};
use crate::traits::{AreaBuckets, AreaStorage, StorageArea, StorageError, StorageResult};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::retry::{RetryConfig, RetryMode};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use docflow_core::S3Config;
use std::time::{Duration, Instant};

/// S3 storage with one bucket per area.
///
/// Works against AWS S3 and S3-compatible servers (MinIO, RustFS, ...).
#[derive(Clone)]
pub struct S3AreaStorage {
    client: Client,
    buckets: AreaBuckets,
}

impl S3AreaStorage {
    /// Create a client from connection settings.
    ///
    /// Static credentials are used when both keys are configured; otherwise
    /// the default AWS provider chain applies.
    pub async fn new(config: &S3Config, buckets: AreaBuckets) -> StorageResult<Self> {
        let region_provider =
            RegionProviderChain::first_try(aws_config::Region::new(config.region.clone()));

        let retry_config = RetryConfig::standard()
            .with_max_attempts(5)
            .with_retry_mode(RetryMode::Adaptive);

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .retry_config(retry_config.clone())
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .retry_config(retry_config)
            .force_path_style(config.force_path_style);

        if let Some(ref endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key), Some(secret_key)) => {
                builder = builder.credentials_provider(Credentials::new(
                    access_key.clone(),
                    secret_key.clone(),
                    None,
                    None,
                    "docflow-static",
                ));
            }
            (None, None) => {}
            _ => {
                return Err(StorageError::ConfigError(
                    "S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY must be set together".to_string(),
                ))
            }
        }

        tracing::info!(
            endpoint = ?config.endpoint,
            region = %config.region,
            staging = %buckets.staging,
            production = %buckets.production,
            quarantine = %buckets.quarantine,
            failed = %buckets.failed,
            "S3 area storage configured"
        );

        Ok(Self {
            client: Client::from_conf(builder.build()),
            buckets,
        })
    }

    fn bucket(&self, area: StorageArea) -> &str {
        self.buckets.bucket(area)
    }
}

#[async_trait]
impl AreaStorage for S3AreaStorage {
    async fn upload(
        &self,
        area: StorageArea,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> StorageResult<()> {
        validate_key(key)?;
        let bucket = self.bucket(area);
        let size = data.len() as u64;
        let start = Instant::now();

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    bucket = %bucket,
                    key = %key,
                    size_bytes = size,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 upload failed"
                );
                StorageError::UploadFailed(e.to_string())
            })?;

        tracing::info!(
            bucket = %bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 upload successful"
        );

        Ok(())
    }

    async fn download(&self, area: StorageArea, key: &str) -> StorageResult<Bytes> {
        validate_key(key)?;
        let bucket = self.bucket(area);
        let start = Instant::now();

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(service_err)
                    if matches!(service_err.err(), GetObjectError::NoSuchKey(_)) =>
                {
                    StorageError::NotFound(format!("{}/{}", bucket, key))
                }
                _ => {
                    tracing::error!(
                        error = %e,
                        bucket = %bucket,
                        key = %key,
                        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                        "S3 download failed"
                    );
                    StorageError::DownloadFailed(e.to_string())
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::DownloadFailed(e.to_string()))?
            .into_bytes();

        tracing::info!(
            bucket = %bucket,
            key = %key,
            size_bytes = data.len() as u64,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 download successful"
        );

        Ok(data)
    }

    async fn delete(&self, area: StorageArea, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let bucket = self.bucket(area);
        let start = Instant::now();

        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    bucket = %bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 delete failed"
                );
                StorageError::DeleteFailed(e.to_string())
            })?;

        tracing::info!(
            bucket = %bucket,
            key = %key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 delete successful"
        );

        Ok(())
    }

    async fn copy_between_areas(
        &self,
        src: StorageArea,
        dst: StorageArea,
        key: &str,
    ) -> StorageResult<()> {
        validate_key(key)?;
        let src_bucket = self.bucket(src);
        let dst_bucket = self.bucket(dst);
        let start = Instant::now();

        self.client
            .copy_object()
            .bucket(dst_bucket)
            .copy_source(copy_source(src_bucket, key))
            .key(key)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    from_bucket = %src_bucket,
                    to_bucket = %dst_bucket,
                    key = %key,
                    "S3 copy failed"
                );
                match &e {
                    SdkError::ServiceError(service_err)
                        if service_err.raw().status().as_u16() == 404 =>
                    {
                        StorageError::NotFound(format!("{}/{}", src_bucket, key))
                    }
                    _ => StorageError::CopyFailed(e.to_string()),
                }
            })?;

        tracing::info!(
            from_bucket = %src_bucket,
            to_bucket = %dst_bucket,
            key = %key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 copy successful"
        );

        Ok(())
    }

    async fn signed_url(
        &self,
        area: StorageArea,
        key: &str,
        ttl: Duration,
    ) -> StorageResult<String> {
        validate_key(key)?;
        let presigning_config = aws_sdk_s3::presigning::PresigningConfig::builder()
            .expires_in(ttl)
            .build()
            .map_err(|e| StorageError::BackendError(e.to_string()))?;

        let presigned_request = self
            .client
            .get_object()
            .bucket(self.bucket(area))
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| StorageError::BackendError(e.to_string()))?;

        Ok(presigned_request.uri().to_string())
    }

    async fn exists(&self, area: StorageArea, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        match self
            .client
            .head_object()
            .bucket(self.bucket(area))
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match &e {
                SdkError::ServiceError(service_err)
                    if matches!(service_err.err(), HeadObjectError::NotFound(_)) =>
                {
                    Ok(false)
                }
                _ => Err(StorageError::BackendError(e.to_string())),
            },
        }
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}
