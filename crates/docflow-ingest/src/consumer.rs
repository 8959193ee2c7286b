//! rdkafka consumer
//!
//! Adapts a `StreamConsumer` to the broker-agnostic [`PartitionDispatcher`]:
//! the consumer is the dispatcher's [`MessageSource`] and commits through
//! the [`BrokerSession`] below.

use anyhow::Context;
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use std::sync::Arc;
use tokio::sync::watch;

use docflow_core::KafkaConfig;

use crate::dispatcher::{MessageSource, PartitionDispatcher, RetryPolicy};
use crate::error::IngestError;
use crate::handler::{BrokerSession, InboundMessage, MessageRouter};

/// Broker session backed by the shared consumer.
///
/// librdkafka sends group heartbeats from its own thread, so `heartbeat`
/// only records liveness.
struct KafkaSession {
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl BrokerSession for KafkaSession {
    async fn heartbeat(&self) -> anyhow::Result<()> {
        tracing::trace!("Consumer alive");
        Ok(())
    }

    async fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> anyhow::Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .context("Invalid commit offset")?;

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .context("Commit task panicked")?
            .context("Kafka offset commit failed")?;
        Ok(())
    }
}

/// Copy what the handlers need out of the client's buffer.
fn detach(message: &BorrowedMessage<'_>) -> InboundMessage {
    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

struct KafkaSource {
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn next_message(&mut self) -> Option<anyhow::Result<InboundMessage>> {
        // The borrowed message must not outlive this call.
        let received = self.consumer.recv().await.map(|m| detach(&m));
        Some(received.map_err(anyhow::Error::from))
    }
}

pub struct KafkaIngestor {
    consumer: Arc<StreamConsumer>,
    router: Arc<MessageRouter>,
    topics: Vec<String>,
    concurrency: usize,
    retry: RetryPolicy,
}

impl KafkaIngestor {
    /// Build the consumer and subscribe. Fails when a configured topic has
    /// no handler in `router`.
    pub fn new(config: &KafkaConfig, router: MessageRouter) -> Result<Self, IngestError> {
        router.ensure_topics(&config.topics)?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("client.id", &config.client_id)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set(
                "auto.offset.reset",
                if config.from_beginning { "earliest" } else { "latest" },
            )
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", config.heartbeat_interval_ms.to_string())
            .set("enable.partition.eof", "false")
            .create()?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;

        tracing::info!(
            group_id = %config.group_id,
            topics = ?config.topics,
            concurrency = config.concurrency,
            from_beginning = config.from_beginning,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            router: Arc::new(router),
            topics: config.topics.clone(),
            concurrency: config.concurrency,
            retry: RetryPolicy::from_config(config),
        })
    }

    /// Consume until `shutdown` flips to true or a partition worker hits a
    /// fatal error. In-flight messages finish before this returns.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), IngestError> {
        let session = Arc::new(KafkaSession {
            consumer: self.consumer.clone(),
        });
        let dispatcher = PartitionDispatcher::new(self.router, session, self.concurrency)
            .with_retry(self.retry);
        let source = KafkaSource {
            consumer: self.consumer,
        };

        tracing::info!(
            topics = ?self.topics,
            workers = dispatcher.concurrency(),
            "Kafka ingestor running"
        );
        let result = dispatcher.run(source, shutdown).await;
        if result.is_ok() {
            tracing::info!("Kafka ingestor stopped");
        }
        result
    }
}
