//! Job queue: worker pool, LISTEN/NOTIFY or polling, retry, and submission.
//!
//! Shutdown: [`WorkerPool::shutdown`] stops claiming, stops the stalled-job
//! reaper and waits up to the drain timeout for in-flight jobs to finish.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use docflow_core::models::{
    Job, JobHandle, JobPayload, JobProvenance, NewJob, ProcessDocumentRequest,
};
use docflow_core::{ErrorMetadata, JobError, LogLevel, PipelineError, QueueConfig, WorkerConfig};
use docflow_db::{JobStore, JOB_NOTIFY_CHANNEL};

use crate::context::{JobFailure, JobHandler};

/// Upper bound of the delay before a retry.
pub const MAX_RETRY_BACKOFF_MS: i64 = 60 * 60 * 1000;

/// Delay before the attempt following `attempts_made` attempts:
/// `backoff_ms * 2^(attempts_made - 1)`, capped.
#[inline]
pub(crate) fn compute_retry_backoff_ms(backoff_ms: i64, attempts_made: i32) -> i64 {
    let exponent = (attempts_made - 1).clamp(0, 32) as u32;
    backoff_ms
        .max(0)
        .saturating_mul(2_i64.saturating_pow(exponent))
        .min(MAX_RETRY_BACKOFF_MS)
}

/// The typed pipeline error behind `err`, looking through a `JobError` wrapper.
fn pipeline_error(err: &anyhow::Error) -> Option<&PipelineError> {
    match err.downcast_ref::<JobError>() {
        Some(job_err) => job_err.inner().downcast_ref::<PipelineError>(),
        None => err.downcast_ref::<PipelineError>(),
    }
}

#[derive(Clone, Debug)]
pub struct JobQueueConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub lease: Duration,
    /// Interval between stalled-job sweeps; 0 disables the reaper
    pub stalled_check_secs: u64,
    pub drain_timeout_secs: u64,
    pub attempts: i32,
    pub backoff_ms: i64,
    pub remove_on_complete: bool,
    pub remove_on_fail: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 1000,
            lease: Duration::from_secs(300),
            stalled_check_secs: 30,
            drain_timeout_secs: 30,
            attempts: 3,
            backoff_ms: 5000,
            remove_on_complete: true,
            remove_on_fail: 1000,
        }
    }
}

impl JobQueueConfig {
    pub fn from_config(queue: &QueueConfig, worker: &WorkerConfig) -> Self {
        Self {
            concurrency: worker.concurrency.max(1),
            poll_interval_ms: worker.poll_interval_ms,
            lease: worker.lease(),
            stalled_check_secs: worker.stalled_check_secs,
            drain_timeout_secs: worker.drain_timeout_secs,
            attempts: queue.attempts,
            backoff_ms: queue.backoff_ms,
            remove_on_complete: queue.remove_on_complete,
            remove_on_fail: queue.remove_on_fail,
        }
    }

    fn lease_renewal_interval(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(100))
    }
}

/// How an idle pool learns about new jobs besides polling.
#[derive(Clone)]
pub enum Wakeup {
    /// LISTEN on the job channel through a dedicated connection
    Postgres(sqlx::PgPool),
    /// In-process notifier, used with the in-memory store
    Local(Arc<Notify>),
    /// Poll only
    Poll,
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: JobQueueConfig,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: JobQueueConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Enqueue a processing request. With provenance the job is keyed by
    /// `kafka_{topic}_{partition}_{offset}` and a redelivered event returns
    /// the job created the first time.
    #[tracing::instrument(skip(self, request, provenance), fields(document_id = %request.document_id))]
    pub async fn enqueue(
        &self,
        request: ProcessDocumentRequest,
        provenance: Option<JobProvenance>,
    ) -> Result<JobHandle> {
        let dedupe_key = provenance.as_ref().map(JobProvenance::dedupe_key);
        let payload = JobPayload {
            request,
            provenance,
        };
        let payload = serde_json::to_value(&payload).context("Failed to serialize job payload")?;

        let handle = self
            .store
            .enqueue(NewJob {
                payload,
                dedupe_key,
                max_attempts: self.config.attempts,
                backoff_ms: self.config.backoff_ms,
            })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to enqueue processing job");
                e
            })?;

        Ok(handle)
    }

    /// Spawn the worker pool. It runs until [`WorkerPool::shutdown`].
    pub fn start(&self, handler: Arc<dyn JobHandler>, wakeup: Wakeup) -> WorkerPool {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let store = self.store.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            Self::worker_pool(store, config, handler, wakeup, shutdown_rx).await;
        });

        WorkerPool {
            shutdown_tx,
            handle,
        }
    }

    async fn worker_pool(
        store: Arc<dyn JobStore>,
        config: JobQueueConfig,
        handler: Arc<dyn JobHandler>,
        wakeup: Wakeup,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!(
            concurrency = config.concurrency,
            poll_interval_ms = config.poll_interval_ms,
            lease_secs = config.lease.as_secs(),
            listen_notify = matches!(wakeup, Wakeup::Postgres(_)),
            "Job queue worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let poll_interval = Duration::from_millis(config.poll_interval_ms);

        // Wakes the main loop on NOTIFY without blocking when there is no listener.
        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(16);
        let listener = match wakeup {
            Wakeup::Postgres(pool) => Some(Self::spawn_listener(pool, notify_tx.clone())),
            Wakeup::Local(notify) => {
                let tx = notify_tx.clone();
                Some(tokio::spawn(async move {
                    loop {
                        notify.notified().await;
                        let _ = tx.try_send(());
                    }
                }))
            }
            Wakeup::Poll => None,
        };

        let (reaper_shutdown_tx, mut reaper_shutdown_rx) = mpsc::channel::<()>(1);
        let reaper = (config.stalled_check_secs > 0).then(|| {
            let store = store.clone();
            let handler = handler.clone();
            let retain = config.remove_on_fail;
            let reap_interval = Duration::from_secs(config.stalled_check_secs);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reap_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            Self::reap_stalled(store.as_ref(), handler.as_ref(), retain).await;
                        }
                        _ = reaper_shutdown_rx.recv() => break,
                    }
                }
            })
        });

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Job queue worker pool shutting down");
                    let _ = reaper_shutdown_tx.send(()).await;
                    break;
                }
                _ = notify_rx.recv() => {
                    Self::claim_and_dispatch(&store, &semaphore, &handler, &config).await;
                }
                _ = sleep(poll_interval) => {
                    Self::claim_and_dispatch(&store, &semaphore, &handler, &config).await;
                }
            }
        }

        if let Some(listener) = listener {
            listener.abort();
        }
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }

        let drain_timeout = Duration::from_secs(config.drain_timeout_secs);
        let in_flight = config.concurrency - semaphore.available_permits();
        if in_flight > 0 {
            tracing::info!(in_flight = in_flight, "Waiting for in-flight jobs");
        }
        match tokio::time::timeout(
            drain_timeout,
            semaphore.acquire_many(config.concurrency as u32),
        )
        .await
        {
            Ok(_) => tracing::info!("Job queue worker pool stopped"),
            Err(_) => tracing::warn!(
                in_flight = config.concurrency - semaphore.available_permits(),
                drain_timeout_secs = config.drain_timeout_secs,
                "Drain timeout elapsed, abandoning in-flight jobs to the stalled-job reaper"
            ),
        };
    }

    fn spawn_listener(pool: sqlx::PgPool, tx: mpsc::Sender<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match sqlx::postgres::PgListener::connect_with(&pool).await {
                    Ok(mut listener) => {
                        if let Err(e) = listener.listen(JOB_NOTIFY_CHANNEL).await {
                            tracing::warn!(error = %e, "LISTEN failed, will retry");
                            sleep(Duration::from_secs(5)).await;
                            continue;
                        }
                        while listener.recv().await.is_ok() {
                            let _ = tx.try_send(());
                        }
                        tracing::warn!("Job notification listener disconnected, reconnecting");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "PgListener connect failed, will retry");
                        sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        })
    }

    /// Claim jobs while there are free workers and runnable jobs.
    async fn claim_and_dispatch(
        store: &Arc<dyn JobStore>,
        semaphore: &Arc<Semaphore>,
        handler: &Arc<dyn JobHandler>,
        config: &JobQueueConfig,
    ) {
        loop {
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::debug!("No workers available, skipping claim");
                    return;
                }
            };

            match store.claim_next(config.lease).await {
                Ok(Some(job)) => {
                    let store = store.clone();
                    let handler = handler.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = Self::run_job(job, store, handler, &config).await {
                            tracing::error!(error = %e, "Failed to record job outcome");
                        }
                    });
                }
                Ok(None) => {
                    tracing::trace!("No jobs available in queue");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim job from queue");
                    return;
                }
            }
        }
    }

    /// Keep the lease of `job` alive while it runs.
    fn spawn_lease_renewal(
        store: Arc<dyn JobStore>,
        job_id: uuid::Uuid,
        config: &JobQueueConfig,
    ) -> JoinHandle<()> {
        let lease = config.lease;
        let every = config.lease_renewal_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                match store.extend_lease(job_id, lease).await {
                    Ok(true) => tracing::trace!(job_id = %job_id, "Job lease extended"),
                    Ok(false) => {
                        tracing::warn!(job_id = %job_id, "Job is no longer active, stopping lease renewal");
                        break;
                    }
                    Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to extend job lease"),
                }
            }
        })
    }

    #[tracing::instrument(skip(store, handler, config), fields(job_id = %job.id, attempt = job.attempts_made))]
    async fn run_job(
        job: Job,
        store: Arc<dyn JobStore>,
        handler: Arc<dyn JobHandler>,
        config: &JobQueueConfig,
    ) -> Result<()> {
        let start = Instant::now();
        let renewal = Self::spawn_lease_renewal(store.clone(), job.id, config);
        let result = handler.handle(&job).await;
        renewal.abort();

        match result {
            Ok(value) => {
                store
                    .complete(job.id, config.remove_on_complete)
                    .await
                    .context("Failed to mark job as completed")?;
                tracing::info!(
                    job_id = %job.id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    result = %value,
                    "Job completed"
                );
                Ok(())
            }
            Err(e) => Self::record_failure(&job, e, store.as_ref(), handler.as_ref(), config).await,
        }
    }

    async fn record_failure(
        job: &Job,
        err: anyhow::Error,
        store: &dyn JobStore,
        handler: &dyn JobHandler,
        config: &JobQueueConfig,
    ) -> Result<()> {
        let recoverable = JobError::is_recoverable_error(&err);
        let will_retry = recoverable && job.can_retry();
        let error_code = pipeline_error(&err).map(|e| e.error_code());
        let level = pipeline_error(&err)
            .map(|e| e.log_level())
            .unwrap_or(LogLevel::Error);

        match (will_retry, level) {
            (true, _) | (false, LogLevel::Warn) => tracing::warn!(
                job_id = %job.id,
                error = %format!("{:#}", err),
                error_code = ?error_code,
                attempt = job.attempts_made,
                max_attempts = job.max_attempts,
                will_retry = will_retry,
                "Job attempt failed"
            ),
            (false, LogLevel::Debug) => tracing::info!(
                job_id = %job.id,
                error = %format!("{:#}", err),
                error_code = ?error_code,
                "Job rejected"
            ),
            (false, LogLevel::Error) => tracing::error!(
                job_id = %job.id,
                error = %format!("{:#}", err),
                error_code = ?error_code,
                attempt = job.attempts_made,
                max_attempts = job.max_attempts,
                unrecoverable = !recoverable,
                "Job failed"
            ),
        }

        if will_retry {
            let backoff_ms = compute_retry_backoff_ms(job.backoff_ms, job.attempts_made);
            let run_at = Utc::now() + chrono::Duration::milliseconds(backoff_ms);
            tracing::info!(
                job_id = %job.id,
                next_attempt = job.attempts_made + 1,
                backoff_ms = backoff_ms,
                "Scheduling job retry"
            );
            return store
                .schedule_retry(job.id, run_at, &format!("{:#}", err))
                .await
                .context("Failed to schedule job retry");
        }

        let failure = if recoverable {
            let exhausted = PipelineError::ExhaustedRetries {
                attempts: job.attempts_made,
                message: format!("{:#}", err),
            };
            JobFailure {
                message: exhausted.to_string(),
                stack: Some(format!("{:?}", err)),
            }
        } else {
            JobFailure::from_error(&err)
        };

        // The finalizer runs before the row is marked failed: if this worker
        // dies in between, the reaper finds the job and finalizes again.
        if let Err(e) = handler.on_exhausted(job, &failure).await {
            tracing::error!(job_id = %job.id, error = %e, "Job failure finalizer failed");
        }

        store
            .fail(job.id, &failure.message, config.remove_on_fail)
            .await
            .context("Failed to mark job as failed")
    }

    async fn reap_stalled(store: &dyn JobStore, handler: &dyn JobHandler, retain: usize) {
        let reaped = match store.reap_stalled(retain).await {
            Ok(reaped) => reaped,
            Err(e) => {
                tracing::error!(error = %e, "Stalled job reaper failed");
                return;
            }
        };

        for job in reaped.exhausted {
            let failure = JobFailure::message(
                job.last_error
                    .clone()
                    .unwrap_or_else(|| "job stalled".to_string()),
            );
            if let Err(e) = handler.on_exhausted(&job, &failure).await {
                tracing::error!(job_id = %job.id, error = %e, "Job failure finalizer failed");
            }
        }
    }
}

/// Handle of a running worker pool.
pub struct WorkerPool {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Stop claiming and wait for in-flight jobs (bounded by the drain timeout).
    pub async fn shutdown(self) {
        tracing::info!("Initiating job queue shutdown");
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Worker pool task ended abnormally");
        }
    }
}
