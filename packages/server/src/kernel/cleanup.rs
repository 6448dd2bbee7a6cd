//! Scheduled retention sweeps using tokio-cron-scheduler.
//!
//! Terminal jobs older than the retention window are deleted (events and
//! artifacts cascade via foreign keys), along with expired cache,
//! idempotency, and rate-limit rows.

use anyhow::Result;
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};

use super::idempotency::IdempotencyKey;
use super::profile_cache::CachedProfile;
use super::rate_limit::RateLimiter;

/// Start the cleanup scheduler. Runs every 6 hours.
pub async fn start_scheduler(pool: PgPool, retention_days: i64) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let sweep_pool = pool.clone();
    let sweep_job = Job::new_async("0 0 */6 * * *", move |_uuid, _lock| {
        let pool = sweep_pool.clone();
        Box::pin(async move {
            if let Err(e) = run_retention_sweep(&pool, retention_days).await {
                tracing::error!(error = %e, "retention sweep failed");
            }
        })
    })?;

    scheduler.add(sweep_job).await?;
    scheduler.start().await?;

    tracing::info!(retention_days, "cleanup scheduler started (every 6 hours)");
    Ok(scheduler)
}

/// Delete terminal jobs past retention and all expired auxiliary rows.
pub async fn run_retention_sweep(pool: &PgPool, retention_days: i64) -> Result<()> {
    let jobs_removed = sqlx::query(
        r#"
        DELETE FROM pipeline_jobs
        WHERE status IN ('completed', 'error', 'cancelled')
          AND finished_at < NOW() - ($1 || ' days')::INTERVAL
        "#,
    )
    .bind(retention_days.to_string())
    .execute(pool)
    .await?
    .rows_affected();

    let cache_removed = CachedProfile::purge_expired(pool).await?;
    let idem_removed = IdempotencyKey::purge_expired(pool).await?;
    let buckets_removed = RateLimiter::purge_expired(pool).await?;

    tracing::info!(
        jobs_removed,
        cache_removed,
        idem_removed,
        buckets_removed,
        "retention sweep complete"
    );

    Ok(())
}
