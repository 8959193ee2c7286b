//! Process wiring: database, storage, worker pool and ingestor.

pub mod database;
pub mod services;
pub mod storage;

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use docflow_core::PipelineConfig;
use docflow_db::{DocumentRepository, JobRepository};
use docflow_ingest::{DocumentUploadedHandler, KafkaIngestor, MessageRouter};
use docflow_worker::{JobQueue, JobQueueConfig, Wakeup, WorkerPool};

/// A started worker pool plus the ingestor feeding it.
pub struct Pipeline {
    ingestor: KafkaIngestor,
    workers: WorkerPool,
}

pub async fn initialize_pipeline(config: &PipelineConfig) -> Result<Pipeline> {
    let pool = database::setup_database(&config.database).await?;
    let storage = storage::setup_storage(&config.storage).await?;

    let documents = Arc::new(DocumentRepository::new(pool.clone()));
    let processor = services::build_processor(config, documents, storage)?;

    let queue = JobQueue::new(
        Arc::new(JobRepository::new(pool.clone())),
        JobQueueConfig::from_config(&config.queue, &config.worker),
    );
    let workers = queue.start(Arc::new(processor), Wakeup::Postgres(pool));

    let mut router = MessageRouter::new();
    for topic in &config.kafka.topics {
        router = router.register(
            topic.clone(),
            Arc::new(DocumentUploadedHandler::new(
                queue.clone(),
                config.kafka.skip_invalid,
            )),
        );
    }
    let ingestor = KafkaIngestor::new(&config.kafka, router)
        .context("Failed to start Kafka consumer")?;

    Ok(Pipeline { ingestor, workers })
}

impl Pipeline {
    /// Run until `shutdown` resolves or the ingestor fails. The ingestor is
    /// stopped first so nothing is committed after the workers start
    /// draining.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut ingest = tokio::spawn(self.ingestor.run(stop_rx));

        let ingest_result = tokio::select! {
            _ = shutdown => {
                let _ = stop_tx.send(true);
                (&mut ingest).await
            }
            joined = &mut ingest => joined,
        };

        self.workers.shutdown().await;

        match ingest_result {
            Ok(Ok(())) => {
                tracing::info!("Pipeline stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Ingestor stopped on a fatal error");
                Err(e.into())
            }
            Err(e) => Err(anyhow::anyhow!("Ingestor task failed: {}", e)),
        }
    }
}
