//! Configuration module
//!
//! `PipelineConfig` is built once at process start from the environment (and
//! an optional `.env` file) and then handed by reference to every component.

use std::env;
use std::str::FromStr;
use std::time::Duration;

// Database
const DB_MAX_CONNECTIONS: u32 = 10;
const DB_TIMEOUT_SECS: u64 = 30;
// Broker
const KAFKA_CLIENT_ID: &str = "docflow-worker";
const KAFKA_BROKER_URL: &str = "localhost:9092";
const KAFKA_TOPICS: &str = "document.uploaded";
const KAFKA_SESSION_TIMEOUT_MS: u64 = 30_000;
const KAFKA_HEARTBEAT_INTERVAL_MS: u64 = 3_000;
const KAFKA_CONCURRENCY: usize = 1;
/// Upper bound on partition workers
pub const MAX_KAFKA_CONCURRENCY: usize = 256;
const KAFKA_RETRIES: u32 = 5;
const KAFKA_RETRY_INITIAL_MS: u64 = 300;
const KAFKA_RETRY_MAX_MS: u64 = 30_000;
// Queue
const QUEUE_ATTEMPTS: i32 = 3;
const QUEUE_BACKOFF_MS: i64 = 5_000;
const QUEUE_REMOVE_ON_FAIL: usize = 1_000;
// Worker
const WORKER_CONCURRENCY: usize = 4;
const WORKER_POLL_INTERVAL_MS: u64 = 1_000;
const WORKER_LEASE_SECS: u64 = 300;
const WORKER_STALLED_CHECK_SECS: u64 = 30;
const WORKER_DRAIN_TIMEOUT_SECS: u64 = 30;
// Scanner
const CLAMAV_HOST: &str = "localhost";
const CLAMAV_PORT: u16 = 3310;
const CLAMAV_TIMEOUT_MS: u64 = 60_000;
// Storage
const S3_REGION: &str = "us-east-1";
const LOCAL_STORAGE_PATH: &str = "./storage";
const SIGNED_URL_TTL_SECS: u64 = 3_600;
// Processing
const TRANSCODE_TIMEOUT_SECS: u64 = 600;

/// Parse a boolean flag; accepts `1/true/yes/y/on` (case-insensitive).
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_optional(key)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_optional(key).map(|v| parse_bool(&v)).unwrap_or(default)
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    env_string(key, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_seconds: u64,
}

#[derive(Clone, Debug)]
pub struct KafkaConfig {
    pub client_id: String,
    pub brokers: Vec<String>,
    pub group_id: String,
    pub topics: Vec<String>,
    pub from_beginning: bool,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Number of partition workers
    pub concurrency: usize,
    /// Commit and skip unparseable or invalid messages instead of halting
    pub skip_invalid: bool,
    /// Redeliveries of a message whose enqueue or commit failed, before the
    /// ingestor gives up
    pub retries: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub attempts: i32,
    pub backoff_ms: i64,
    pub remove_on_complete: bool,
    /// Number of failed jobs kept for inspection
    pub remove_on_fail: usize,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub lease_secs: u64,
    pub stalled_check_secs: u64,
    pub drain_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScannerPreference {
    /// Talk to the clamd daemon first, fall back to the local binary
    Clamdscan,
    /// Run the local `clamscan` binary
    Clamscan,
}

impl FromStr for ScannerPreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "clamdscan" | "clamd" => Ok(ScannerPreference::Clamdscan),
            "clamscan" => Ok(ScannerPreference::Clamscan),
            other => Err(anyhow::anyhow!("Invalid CLAMAV_PREFERENCE: {}", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClamAvConfig {
    pub socket: Option<String>,
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub clamdscan_path: String,
    pub clamscan_path: String,
    pub preference: ScannerPreference,
    pub fail_closed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Local,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s3" => Ok(StorageBackend::S3),
            "local" => Ok(StorageBackend::Local),
            other => Err(anyhow::anyhow!("Invalid STORAGE_BACKEND: {}", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub s3: S3Config,
    pub staging_bucket: String,
    pub production_bucket: String,
    pub quarantine_bucket: String,
    pub failed_bucket: String,
    pub local_path: String,
    pub signed_url_ttl_secs: u64,
}

impl StorageConfig {
    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }
}

#[derive(Clone, Debug)]
pub struct ProcessingConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub transcode_timeout_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Complete process configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub kafka: KafkaConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub clamav: ClamAvConfig,
    pub storage: StorageConfig,
    pub processing: ProcessingConfig,
    pub log_format: LogFormat,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            max_connections: env_parse("DB_MAX_CONNECTIONS", DB_MAX_CONNECTIONS),
            timeout_seconds: env_parse("DB_TIMEOUT_SECONDS", DB_TIMEOUT_SECS),
        };

        let kafka = KafkaConfig {
            client_id: env_string("KAFKA_CLIENT_ID", KAFKA_CLIENT_ID),
            brokers: env_list("KAFKA_BROKER_URL", KAFKA_BROKER_URL),
            group_id: env::var("KAFKA_GROUP_ID")
                .map_err(|_| anyhow::anyhow!("KAFKA_GROUP_ID must be set"))?,
            topics: env_list("KAFKA_TOPICS", KAFKA_TOPICS),
            from_beginning: env_bool("KAFKA_FROM_BEGINNING", false),
            session_timeout_ms: env_parse("KAFKA_SESSION_TIMEOUT_MS", KAFKA_SESSION_TIMEOUT_MS),
            heartbeat_interval_ms: env_parse(
                "KAFKA_HEARTBEAT_INTERVAL_MS",
                KAFKA_HEARTBEAT_INTERVAL_MS,
            ),
            concurrency: env_parse("KAFKA_CONCURRENCY", KAFKA_CONCURRENCY),
            skip_invalid: env_bool("KAFKA_SKIP_INVALID", false),
            retries: env_parse("KAFKA_RETRIES", KAFKA_RETRIES),
            retry_initial_ms: env_parse("KAFKA_RETRY_INITIAL_MS", KAFKA_RETRY_INITIAL_MS),
            retry_max_ms: env_parse("KAFKA_RETRY_MAX_MS", KAFKA_RETRY_MAX_MS),
        };

        let queue = QueueConfig {
            attempts: env_parse("QUEUE_ATTEMPTS", QUEUE_ATTEMPTS),
            backoff_ms: env_parse("QUEUE_BACKOFF_MS", QUEUE_BACKOFF_MS),
            remove_on_complete: env_bool("QUEUE_REMOVE_ON_COMPLETE", true),
            remove_on_fail: env_parse("QUEUE_REMOVE_ON_FAIL", QUEUE_REMOVE_ON_FAIL),
        };

        let worker = WorkerConfig {
            concurrency: env_parse("WORKER_CONCURRENCY", WORKER_CONCURRENCY),
            poll_interval_ms: env_parse("WORKER_POLL_INTERVAL_MS", WORKER_POLL_INTERVAL_MS),
            lease_secs: env_parse("WORKER_LEASE_SECS", WORKER_LEASE_SECS),
            stalled_check_secs: env_parse("WORKER_STALLED_CHECK_SECS", WORKER_STALLED_CHECK_SECS),
            drain_timeout_secs: env_parse("WORKER_DRAIN_TIMEOUT_SECS", WORKER_DRAIN_TIMEOUT_SECS),
        };

        let clamav = ClamAvConfig {
            socket: env_optional("CLAMAV_SOCKET"),
            host: env_string("CLAMAV_HOST", CLAMAV_HOST),
            port: env_parse("CLAMAV_PORT", CLAMAV_PORT),
            timeout_ms: env_parse("CLAMAV_TIMEOUT", CLAMAV_TIMEOUT_MS),
            clamdscan_path: env_string("CLAMAV_PATH", "clamdscan"),
            clamscan_path: env_string("CLAMSCAN_PATH", "clamscan"),
            preference: env_string("CLAMAV_PREFERENCE", "clamdscan").parse()?,
            fail_closed: env_bool("CLAMAV_FAIL_CLOSED", true),
        };

        let storage = StorageConfig {
            backend: env_string("STORAGE_BACKEND", "s3").parse()?,
            s3: S3Config {
                endpoint: env_optional("S3_ENDPOINT"),
                region: env_string("S3_REGION", S3_REGION),
                access_key_id: env_optional("S3_ACCESS_KEY_ID"),
                secret_access_key: env_optional("S3_SECRET_ACCESS_KEY"),
                force_path_style: env_bool("S3_FORCE_PATH_STYLE", true),
            },
            staging_bucket: env_string("S3_STAGING_BUCKET", "staging"),
            production_bucket: env_string("S3_PRODUCTION_BUCKET", "production"),
            quarantine_bucket: env_string("S3_QUARANTINE_BUCKET", "quarantine"),
            failed_bucket: env_string("S3_FAILED_BUCKET", "failed"),
            local_path: env_string("LOCAL_STORAGE_PATH", LOCAL_STORAGE_PATH),
            signed_url_ttl_secs: env_parse("SIGNED_URL_TTL_SECS", SIGNED_URL_TTL_SECS),
        };

        let processing = ProcessingConfig {
            ffmpeg_path: env_string("FFMPEG_PATH", "ffmpeg"),
            ffprobe_path: env_string("FFPROBE_PATH", "ffprobe"),
            transcode_timeout_secs: env_parse("TRANSCODE_TIMEOUT_SECS", TRANSCODE_TIMEOUT_SECS),
        };

        let log_format = match env_string("LOG_FORMAT", "pretty").to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let config = PipelineConfig {
            database,
            kafka,
            queue,
            worker,
            clamav,
            storage,
            processing,
            log_format,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.database.url.starts_with("postgres://")
            && !self.database.url.starts_with("postgresql://")
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid PostgreSQL connection string"
            ));
        }

        if self.kafka.group_id.trim().is_empty() {
            return Err(anyhow::anyhow!("KAFKA_GROUP_ID must not be empty"));
        }

        if self.kafka.topics.is_empty() {
            return Err(anyhow::anyhow!("KAFKA_TOPICS must name at least one topic"));
        }

        if self.kafka.brokers.is_empty() {
            return Err(anyhow::anyhow!("KAFKA_BROKER_URL must name at least one broker"));
        }

        if self.kafka.concurrency == 0 || self.worker.concurrency == 0 {
            return Err(anyhow::anyhow!(
                "KAFKA_CONCURRENCY and WORKER_CONCURRENCY must be at least 1"
            ));
        }

        if self.kafka.concurrency > MAX_KAFKA_CONCURRENCY {
            return Err(anyhow::anyhow!(
                "KAFKA_CONCURRENCY must be at most {}",
                MAX_KAFKA_CONCURRENCY
            ));
        }

        if self.kafka.retry_initial_ms == 0 || self.kafka.retry_max_ms < self.kafka.retry_initial_ms {
            return Err(anyhow::anyhow!(
                "KAFKA_RETRY_INITIAL_MS must be positive and not above KAFKA_RETRY_MAX_MS"
            ));
        }

        if self.queue.attempts < 1 {
            return Err(anyhow::anyhow!("QUEUE_ATTEMPTS must be at least 1"));
        }

        if self.queue.backoff_ms < 0 {
            return Err(anyhow::anyhow!("QUEUE_BACKOFF_MS must not be negative"));
        }

        let buckets = [
            &self.storage.staging_bucket,
            &self.storage.production_bucket,
            &self.storage.quarantine_bucket,
            &self.storage.failed_bucket,
        ];
        for (i, a) in buckets.iter().enumerate() {
            if buckets[i + 1..].contains(a) {
                return Err(anyhow::anyhow!(
                    "Storage areas must use distinct buckets ('{}' is used twice)",
                    a
                ));
            }
        }

        Ok(())
    }
}
