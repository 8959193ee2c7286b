//! Job handler contract
//!
//! The queue knows nothing about documents. It claims a job, hands it to a
//! [`JobHandler`] and applies the retry policy to the outcome; the handler is
//! told once when a job will never run again so it can clean up after it.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use docflow_core::models::Job;

/// Why a job stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    /// Debug rendering of the error chain, when one exists
    pub stack: Option<String>,
}

impl JobFailure {
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: format!("{:#}", err),
            stack: Some(format!("{:?}", err)),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt of `job`. The returned value is logged as the job result.
    async fn handle(&self, job: &Job) -> Result<Value>;

    /// Called once for a job that will not be attempted again: the error was
    /// unrecoverable, the attempt budget is spent, or the job stalled on its
    /// final attempt.
    async fn on_exhausted(&self, job: &Job, failure: &JobFailure) -> Result<()>;
}
