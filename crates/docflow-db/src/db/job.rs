use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres};
use std::time::Duration;
use uuid::Uuid;

use docflow_core::models::{Job, JobHandle, NewJob};

use crate::traits::{JobStore, ReapedJobs};

/// Channel notified on every new job so idle workers wake before the next poll.
pub const JOB_NOTIFY_CHANNEL: &str = "docflow_new_job";

#[derive(Clone)]
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_by_dedupe_key(conn: &mut PgConnection, dedupe_key: &str) -> Result<Option<Job>> {
        let job: Option<Job> = sqlx::query_as::<Postgres, Job>(
            r#"
            SELECT
                id,
                dedupe_key,
                payload,
                status,
                attempts_made,
                max_attempts,
                backoff_ms,
                run_at,
                locked_until,
                last_error,
                created_at,
                updated_at,
                finished_at
            FROM processing_jobs
            WHERE dedupe_key = $1
            "#,
        )
        .bind(dedupe_key)
        .fetch_optional(conn)
        .await
        .context("Failed to look up job by dedup key")?;

        Ok(job)
    }

    /// Delete failed jobs beyond the newest `retain`.
    async fn prune_failed(conn: &mut PgConnection, retain: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM processing_jobs
            WHERE status = 'failed'
                AND id NOT IN (
                    SELECT id
                    FROM processing_jobs
                    WHERE status = 'failed'
                    ORDER BY finished_at DESC NULLS LAST, id
                    LIMIT $1
                )
            "#,
        )
        .bind(retain as i64)
        .execute(conn)
        .await
        .context("Failed to prune failed jobs")?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            tracing::debug!(pruned = pruned, retain = retain, "Pruned failed jobs");
        }
        Ok(pruned)
    }
}

#[async_trait]
impl JobStore for JobRepository {
    #[tracing::instrument(skip(self, job), fields(dedupe_key = ?job.dedupe_key))]
    async fn enqueue(&self, job: NewJob) -> Result<JobHandle> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for enqueue")?;

        // A NULL dedup key never conflicts, so jobs without provenance always insert.
        let inserted: Option<Job> = sqlx::query_as::<Postgres, Job>(
            r#"
            INSERT INTO processing_jobs (dedupe_key, payload, max_attempts, backoff_ms)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (dedupe_key) DO NOTHING
            RETURNING
                id,
                dedupe_key,
                payload,
                status,
                attempts_made,
                max_attempts,
                backoff_ms,
                run_at,
                locked_until,
                last_error,
                created_at,
                updated_at,
                finished_at
            "#,
        )
        .bind(job.dedupe_key.as_deref())
        .bind(&job.payload)
        .bind(job.max_attempts)
        .bind(job.backoff_ms)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to insert job")?;

        let handle = match inserted {
            Some(created) => {
                // Workers poll as well, so a failed notify only delays pickup.
                if let Err(e) = sqlx::query("SELECT pg_notify($1, '')")
                    .bind(JOB_NOTIFY_CHANNEL)
                    .execute(&mut *tx)
                    .await
                {
                    tracing::warn!(
                        error = %e,
                        job_id = %created.id,
                        "Failed to send pg_notify for new job, workers will find it by polling"
                    );
                }
                JobHandle::from_job(&created, true)
            }
            None => {
                let key = job
                    .dedupe_key
                    .as_deref()
                    .context("Insert without dedup key returned no row")?;
                let existing = Self::find_by_dedupe_key(&mut *tx, key)
                    .await?
                    .with_context(|| format!("Job with dedup key {} vanished during enqueue", key))?;
                JobHandle::from_job(&existing, false)
            }
        };

        tx.commit()
            .await
            .context("Failed to commit enqueue transaction")?;

        if handle.created {
            tracing::info!(job_id = %handle.id, dedupe_key = ?handle.dedupe_key, "Job enqueued");
        } else {
            tracing::info!(
                job_id = %handle.id,
                dedupe_key = ?handle.dedupe_key,
                status = %handle.status,
                "Duplicate job, returning existing"
            );
        }

        Ok(handle)
    }

    #[tracing::instrument(skip(self))]
    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let next: Option<Uuid> = sqlx::query_scalar::<Postgres, Uuid>(
            r#"
            SELECT id
            FROM processing_jobs
            WHERE status IN ('waiting', 'delayed')
                AND run_at <= NOW()
            ORDER BY run_at ASC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to fetch next job")?;

        let Some(job_id) = next else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let job: Job = sqlx::query_as::<Postgres, Job>(
            r#"
            UPDATE processing_jobs
            SET status = 'active',
                attempts_made = attempts_made + 1,
                locked_until = NOW() + make_interval(secs => $2),
                updated_at = NOW()
            WHERE id = $1
            RETURNING
                id,
                dedupe_key,
                payload,
                status,
                attempts_made,
                max_attempts,
                backoff_ms,
                run_at,
                locked_until,
                last_error,
                created_at,
                updated_at,
                finished_at
            "#,
        )
        .bind(job_id)
        .bind(lease.as_secs_f64())
        .fetch_one(&mut *tx)
        .await
        .context("Failed to mark job active")?;

        tx.commit().await.context("Failed to commit transaction")?;

        tracing::debug!(
            job_id = %job.id,
            attempt = job.attempts_made,
            max_attempts = job.max_attempts,
            "Job claimed"
        );

        Ok(Some(job))
    }

    #[tracing::instrument(skip(self))]
    async fn extend_lease(&self, job_id: Uuid, lease: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET locked_until = NOW() + make_interval(secs => $2),
                updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(job_id)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("Failed to extend job lease")?;

        Ok(result.rows_affected() == 1)
    }

    /// Only an `active` row is touched: once the reaper has taken the job
    /// back, a late runner must not overwrite it.
    #[tracing::instrument(skip(self))]
    async fn complete(&self, job_id: Uuid, remove: bool) -> Result<()> {
        let result = if remove {
            sqlx::query("DELETE FROM processing_jobs WHERE id = $1 AND status = 'active'")
                .bind(job_id)
                .execute(&self.pool)
                .await
                .context("Failed to remove completed job")?
        } else {
            sqlx::query(
                r#"
                UPDATE processing_jobs
                SET status = 'completed',
                    locked_until = NULL,
                    finished_at = NOW(),
                    updated_at = NOW()
                WHERE id = $1 AND status = 'active'
                "#,
            )
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark job as completed")?
        };

        if result.rows_affected() == 0 {
            tracing::warn!(job_id = %job_id, "Job is no longer active, completion ignored");
        } else {
            tracing::debug!(job_id = %job_id, removed = remove, "Job completed");
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, error))]
    async fn schedule_retry(
        &self,
        job_id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = CASE WHEN $2 > NOW() THEN 'delayed' ELSE 'waiting' END,
                run_at = $2,
                last_error = $3,
                locked_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(job_id)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to schedule job retry")?;

        Ok(())
    }

    #[tracing::instrument(skip(self, error))]
    async fn fail(&self, job_id: Uuid, error: &str, retain: usize) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let result = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'failed',
                last_error = $2,
                locked_until = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&mut *tx)
        .await
        .context("Failed to mark job as failed")?;

        if result.rows_affected() == 0 {
            tracing::warn!(job_id = %job_id, "Job is no longer active, failure ignored");
        }

        Self::prune_failed(&mut *tx, retain).await?;

        tx.commit().await.context("Failed to commit transaction")?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn reap_stalled(&self, retain: usize) -> Result<ReapedJobs> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let exhausted: Vec<Job> = sqlx::query_as::<Postgres, Job>(
            r#"
            UPDATE processing_jobs
            SET status = 'failed',
                last_error = 'job stalled: lease expired on final attempt',
                locked_until = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE status = 'active'
                AND locked_until < NOW()
                AND attempts_made >= max_attempts
            RETURNING
                id,
                dedupe_key,
                payload,
                status,
                attempts_made,
                max_attempts,
                backoff_ms,
                run_at,
                locked_until,
                last_error,
                created_at,
                updated_at,
                finished_at
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .context("Failed to fail exhausted stalled jobs")?;

        let requeued = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'waiting',
                run_at = NOW(),
                last_error = 'job stalled: lease expired',
                locked_until = NULL,
                updated_at = NOW()
            WHERE status = 'active'
                AND locked_until < NOW()
                AND attempts_made < max_attempts
            "#,
        )
        .execute(&mut *tx)
        .await
        .context("Failed to requeue stalled jobs")?
        .rows_affected();

        if !exhausted.is_empty() {
            Self::prune_failed(&mut *tx, retain).await?;
        }

        tx.commit().await.context("Failed to commit transaction")?;

        if requeued > 0 || !exhausted.is_empty() {
            tracing::warn!(
                requeued = requeued,
                exhausted = exhausted.len(),
                "Recovered stalled jobs"
            );
        }

        Ok(ReapedJobs {
            requeued,
            exhausted,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let job: Option<Job> = sqlx::query_as::<Postgres, Job>(
            r#"
            SELECT
                id,
                dedupe_key,
                payload,
                status,
                attempts_made,
                max_attempts,
                backoff_ms,
                run_at,
                locked_until,
                last_error,
                created_at,
                updated_at,
                finished_at
            FROM processing_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch job")?;

        Ok(job)
    }
}
