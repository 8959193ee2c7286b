use docflow_core::PipelineError;
use thiserror::Error;

/// Errors that stop consumption. Anything the skip-invalid policy tolerates
/// never becomes an `IngestError`.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Poison(PipelineError),

    #[error("No handler registered for topic {topic} ({partition}@{offset})")]
    UnhandledTopic {
        topic: String,
        partition: i32,
        offset: i64,
    },

    #[error("Failed to enqueue message {topic}[{partition}]@{offset}")]
    Enqueue {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to commit offset {next_offset} on {topic}[{partition}]")]
    Commit {
        topic: String,
        partition: i32,
        next_offset: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("Broker heartbeat failed")]
    Heartbeat(#[source] anyhow::Error),

    #[error("Kafka client error: {0}")]
    Kafka(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Partition worker {0} stopped unexpectedly")]
    WorkerStopped(usize),
}

impl IngestError {
    /// Failures of the queue or the broker that a later redelivery of the
    /// same message may not hit. Everything else halts at once.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::Enqueue { .. } | IngestError::Commit { .. } | IngestError::Heartbeat(_)
        )
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for IngestError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        IngestError::Kafka(err.to_string())
    }
}
