//! Storage setup and initialization

use anyhow::{Context, Result};
use docflow_core::StorageConfig;
use docflow_storage::{create_storage, AreaStorage};
use std::sync::Arc;

pub async fn setup_storage(config: &StorageConfig) -> Result<Arc<dyn AreaStorage>> {
    tracing::info!("Initializing area storage...");
    let storage = create_storage(config)
        .await
        .context("Failed to initialize storage backend")?;
    tracing::info!(
        backend = storage.backend_name(),
        staging = %config.staging_bucket,
        production = %config.production_bucket,
        quarantine = %config.quarantine_bucket,
        failed = %config.failed_bucket,
        "Area storage initialized"
    );
    Ok(storage)
}
