//! Docflow Event Ingestor
//!
//! Turns "document uploaded" events into processing jobs. A message is only
//! acknowledged on the broker once its job is durably enqueued, so a crash
//! between the two leads to a redelivery that the queue deduplicates.

pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod payload;

#[cfg(feature = "kafka")]
pub mod consumer;

#[cfg(feature = "kafka")]
pub use consumer::KafkaIngestor;
pub use dispatcher::{MessageSource, PartitionDispatcher, RetryPolicy};
pub use error::IngestError;
pub use handler::{BrokerSession, DocumentUploadedHandler, InboundMessage, MessageRouter, TopicHandler};
pub use payload::parse_request;
