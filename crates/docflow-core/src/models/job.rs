use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use super::request::ProcessDocumentRequest;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "text", rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Delayed => write!(f, "delayed"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "delayed" => Ok(JobStatus::Delayed),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid job status: {}", s)),
        }
    }
}

/// Where a job came from on the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobProvenance {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl JobProvenance {
    /// Deterministic dedup key: `kafka_{topic}_{partition}_{offset}`.
    ///
    /// Separators are normalized to `_` so a `:` inside a topic name cannot
    /// produce a key that collides with another provenance.
    pub fn dedupe_key(&self) -> String {
        format!("kafka:{}:{}:{}", self.topic, self.partition, self.offset).replace(':', "_")
    }
}

/// The queued unit of work: the request plus its delivery provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobPayload {
    #[serde(flatten)]
    pub request: ProcessDocumentRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<JobProvenance>,
}

/// Row of the durable job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Job {
    pub id: Uuid,
    pub dedupe_key: Option<String>,
    pub payload: Value,
    pub status: JobStatus,
    /// Attempts started so far, including the one in progress
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub backoff_ms: i64,
    pub run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether another attempt may follow the current one.
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    pub fn is_final_attempt(&self) -> bool {
        !self.can_retry()
    }

    pub fn parse_payload(&self) -> anyhow::Result<JobPayload> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| anyhow::anyhow!("Invalid payload for job {}: {}", self.id, e))
    }
}

/// Parameters for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub payload: Value,
    pub dedupe_key: Option<String>,
    pub max_attempts: i32,
    pub backoff_ms: i64,
}

/// Returned by enqueue; `created` is false when a job with the same dedup key
/// already existed and was returned instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: Uuid,
    pub dedupe_key: Option<String>,
    pub status: JobStatus,
    pub created: bool,
}

impl JobHandle {
    pub fn from_job(job: &Job, created: bool) -> Self {
        Self {
            id: job.id,
            dedupe_key: job.dedupe_key.clone(),
            status: job.status,
            created,
        }
    }
}
