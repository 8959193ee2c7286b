//! Capability services and the document processor built on them.

use anyhow::{Context, Result};
use docflow_core::PipelineConfig;
use docflow_db::DocumentStore;
use docflow_processing::{DocumentMetadataExtractor, Transcoders};
use docflow_services::ClamAvScanner;
use docflow_storage::AreaStorage;
use docflow_worker::DocumentProcessor;
use std::sync::Arc;

pub fn build_processor(
    config: &PipelineConfig,
    documents: Arc<dyn DocumentStore>,
    storage: Arc<dyn AreaStorage>,
) -> Result<DocumentProcessor> {
    let scanner = Arc::new(ClamAvScanner::new(config.clamav.clone()));
    tracing::info!(
        preference = ?config.clamav.preference,
        fail_closed = config.clamav.fail_closed,
        "Malware scanner configured"
    );

    let transcoders = Transcoders::from_config(&config.processing)
        .context("Failed to configure transcoders")?;
    tracing::info!(kinds = ?transcoders.kinds(), "Transcoders enabled");

    let extractor = Arc::new(
        DocumentMetadataExtractor::from_config(&config.processing)
            .context("Failed to configure metadata extraction")?,
    );

    Ok(
        DocumentProcessor::new(documents, storage, scanner, transcoders, extractor)
            .with_signed_url_ttl(config.storage.signed_url_ttl()),
    )
}
