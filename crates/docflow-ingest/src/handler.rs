//! Per-message handling, independent of the broker client.
//!
//! Ordering per message: heartbeat, enqueue, heartbeat, commit `offset + 1`.
//! Nothing is committed unless the job is durably enqueued or the message is
//! deliberately skipped.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use docflow_core::models::JobProvenance;
use docflow_core::{PipelineError, PoisonKind};
use docflow_worker::JobQueue;

use crate::error::IngestError;
use crate::payload::parse_request;

/// The broker operations a handler needs.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Tell the group coordinator this consumer is alive.
    async fn heartbeat(&self) -> Result<()>;

    /// Commit `next_offset` (the offset of the next message to read).
    async fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()>;
}

/// One consumed message, detached from the client's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
}

impl InboundMessage {
    fn provenance(&self) -> JobProvenance {
        JobProvenance {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            key: self.key.clone(),
        }
    }

    fn key_label(&self) -> &str {
        self.key.as_deref().unwrap_or("-")
    }
}

async fn commit(session: &dyn BrokerSession, msg: &InboundMessage) -> Result<(), IngestError> {
    let next_offset = msg.offset + 1;
    session
        .commit(&msg.topic, msg.partition, next_offset)
        .await
        .map_err(|source| IngestError::Commit {
            topic: msg.topic.clone(),
            partition: msg.partition,
            next_offset,
            source,
        })
}

#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn handle(&self, msg: &InboundMessage, session: &dyn BrokerSession)
        -> Result<(), IngestError>;
}

/// Enqueues a processing job for each valid "document uploaded" event.
pub struct DocumentUploadedHandler {
    queue: JobQueue,
    skip_invalid: bool,
}

impl DocumentUploadedHandler {
    pub fn new(queue: JobQueue, skip_invalid: bool) -> Self {
        Self {
            queue,
            skip_invalid,
        }
    }

    async fn reject(
        &self,
        msg: &InboundMessage,
        session: &dyn BrokerSession,
        kind: PoisonKind,
        reason: String,
    ) -> Result<(), IngestError> {
        tracing::error!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            key = msg.key_label(),
            kind = %kind,
            reason = %reason,
            "Invalid message"
        );

        if self.skip_invalid {
            commit(session, msg).await?;
            tracing::warn!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                "Invalid message skipped and committed"
            );
            return Ok(());
        }

        Err(IngestError::Poison(PipelineError::PoisonMessage {
            kind,
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
            reason,
        }))
    }
}

#[async_trait]
impl TopicHandler for DocumentUploadedHandler {
    async fn handle(
        &self,
        msg: &InboundMessage,
        session: &dyn BrokerSession,
    ) -> Result<(), IngestError> {
        let payload = msg.payload.as_deref().unwrap_or_default();
        let request = match parse_request(payload) {
            Ok(request) => request,
            Err((kind, reason)) => return self.reject(msg, session, kind, reason).await,
        };

        tracing::info!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            key = msg.key_label(),
            document_id = %request.document_id,
            "Document uploaded event received"
        );

        session.heartbeat().await.map_err(IngestError::Heartbeat)?;
        let handle = self
            .queue
            .enqueue(request, Some(msg.provenance()))
            .await
            .map_err(|source| IngestError::Enqueue {
                topic: msg.topic.clone(),
                partition: msg.partition,
                offset: msg.offset,
                source,
            })?;
        session.heartbeat().await.map_err(IngestError::Heartbeat)?;

        commit(session, msg).await?;
        tracing::info!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            job_id = %handle.id,
            created = handle.created,
            "Event enqueued and committed"
        );
        Ok(())
    }
}

/// Topic → handler table.
#[derive(Clone, Default)]
pub struct MessageRouter {
    handlers: HashMap<String, Arc<dyn TopicHandler>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, topic: impl Into<String>, handler: Arc<dyn TopicHandler>) -> Self {
        self.handlers.insert(topic.into(), handler);
        self
    }

    /// Fail unless every topic in `topics` has a handler.
    pub fn ensure_topics(&self, topics: &[String]) -> Result<(), IngestError> {
        let missing: Vec<&str> = topics
            .iter()
            .filter(|topic| !self.handlers.contains_key(topic.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(IngestError::Config(format!(
                "No handler registered for topic(s): {}",
                missing.join(", ")
            )))
        }
    }

    /// Route one message. An `Err` must stop consumption of its partition.
    pub async fn dispatch(
        &self,
        msg: &InboundMessage,
        session: &dyn BrokerSession,
    ) -> Result<(), IngestError> {
        if msg.payload.as_deref().map_or(true, <[u8]>::is_empty) {
            tracing::warn!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                key = msg.key_label(),
                "Empty message, committing and skipping"
            );
            return commit(session, msg).await;
        }

        let Some(handler) = self.handlers.get(&msg.topic) else {
            // Committing would lose the message; stop instead.
            tracing::error!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                "No handler for topic"
            );
            return Err(IngestError::UnhandledTopic {
                topic: msg.topic.clone(),
                partition: msg.partition,
                offset: msg.offset,
            });
        };

        handler.handle(msg, session).await
    }
}
