//! Queue operations over the pipeline job table.
//!
//! The job row is the queue entry: claiming uses `FOR UPDATE SKIP LOCKED`
//! so each job runs on exactly one worker at a time, leases make crashed
//! workers' jobs claimable again, and redelivery retries back off
//! exponentially (base 5s) up to `max_attempts`.

use anyhow::Result;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use super::job::{PipelineJob, RETRY_BACKOFF_BASE_SECS};
use crate::kernel::events::{EventLevel, JobEvent};

pub struct PipelineQueue {
    db: PgPool,
    lease_secs: i64,
}

impl PipelineQueue {
    pub fn new(db: PgPool, lease_secs: i64) -> Self {
        Self { db, lease_secs }
    }

    /// Claim up to `limit` runnable jobs for this worker.
    ///
    /// Runnable means pending with its backoff elapsed and attempts left, or
    /// running with an expired lease (a crashed worker's job). Claiming
    /// counts an attempt.
    pub async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<PipelineJob>> {
        let jobs = sqlx::query_as::<_, PipelineJob>(
            r#"
            WITH next_jobs AS (
                SELECT job_id
                FROM pipeline_jobs
                WHERE
                    (status = 'pending' AND next_attempt_at <= NOW() AND attempts < max_attempts)
                    OR (status = 'running' AND lease_expires_at < NOW())
                ORDER BY next_attempt_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE pipeline_jobs
            SET status = 'running',
                attempts = attempts + 1,
                worker_id = $2,
                lease_expires_at = NOW() + ($3 || ' seconds')::INTERVAL,
                started_at = COALESCE(started_at, NOW())
            WHERE job_id IN (SELECT job_id FROM next_jobs)
            RETURNING job_id, api_key_id, status, params, meta, progress, current_stage, error,
                      cancel_requested, attempts, max_attempts, next_attempt_at, lease_expires_at,
                      worker_id, created_at, started_at, finished_at
            "#,
        )
        .bind(limit)
        .bind(worker_id)
        .bind(self.lease_secs.to_string())
        .fetch_all(&self.db)
        .await?;

        Ok(jobs)
    }

    /// Extend the lease of a running job (heartbeat).
    pub async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET lease_expires_at = NOW() + ($1 || ' seconds')::INTERVAL
            WHERE job_id = $2 AND status = 'running'
            "#,
        )
        .bind(self.lease_secs.to_string())
        .bind(job_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Release queue bookkeeping after the engine handled the job (the
    /// engine writes terminal statuses itself).
    pub async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET lease_expires_at = NULL, worker_id = NULL
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Handle an infrastructure failure: schedule a redelivery with
    /// exponential backoff, or mark the job terminally errored once attempts
    /// are exhausted.
    pub async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        let Some(job) = PipelineJob::find_by_id(job_id, &self.db).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        if job.attempts < job.max_attempts {
            let delay_secs = retry_delay_secs(job.attempts);
            tracing::warn!(
                job_id = %job_id,
                attempt = job.attempts,
                delay_secs,
                error,
                "job failed, scheduling redelivery"
            );
            sqlx::query(
                r#"
                UPDATE pipeline_jobs
                SET status = 'pending',
                    next_attempt_at = NOW() + ($2 || ' seconds')::INTERVAL,
                    lease_expires_at = NULL,
                    worker_id = NULL
                WHERE job_id = $1 AND status = 'running'
                "#,
            )
            .bind(job_id)
            .bind(delay_secs.to_string())
            .execute(&self.db)
            .await?;
        } else {
            tracing::error!(job_id = %job_id, attempts = job.attempts, error, "job exhausted retries");
            let error_body = json!({"kind": "fatal", "message": error});
            PipelineJob::finish_error(job_id, &error_body, &self.db).await?;
            JobEvent::append(
                job_id,
                EventLevel::Error,
                "pipeline_summary",
                json!({"status": "error", "message": error, "attempts": job.attempts}),
                &self.db,
            )
            .await?;
        }

        Ok(())
    }
}

/// Backoff before redelivery attempt `n+1`, after `n` attempts: 5s, 10s, 20s.
pub fn retry_delay_secs(attempts: i32) -> i64 {
    RETRY_BACKOFF_BASE_SECS << (attempts - 1).clamp(0, 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        assert_eq!(retry_delay_secs(1), 5);
        assert_eq!(retry_delay_secs(2), 10);
        assert_eq!(retry_delay_secs(3), 20);
    }

    #[test]
    fn backoff_is_clamped_for_runaway_attempts() {
        assert!(retry_delay_secs(40) <= RETRY_BACKOFF_BASE_SECS << 10);
        assert_eq!(retry_delay_secs(0), 5);
    }
}
