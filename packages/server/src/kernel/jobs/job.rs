//! Pipeline job model: the durable job row doubles as the queue entry.
//!
//! A job is created exclusively by the admission service and mutated
//! exclusively by the execution engine afterwards, except for
//! `cancel_requested`, which admission sets and the engine reads. Terminal
//! statuses are write-once: every terminal transition is guarded by
//! `status NOT IN ('completed', 'error', 'cancelled')` in SQL.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "pipeline_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are write-once.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "pipeline_stage", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    #[default]
    None,
    QueryExpansion,
    VectorSearch,
    Enrichment,
    Scoring,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::None => "none",
            PipelineStage::QueryExpansion => "query_expansion",
            PipelineStage::VectorSearch => "vector_search",
            PipelineStage::Enrichment => "enrichment",
            PipelineStage::Scoring => "scoring",
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// Retry backoff base for queue redelivery (seconds). Attempt n waits
/// `5 * 2^(n-1)` seconds.
pub const RETRY_BACKOFF_BASE_SECS: i64 = 5;

/// Default worker lease; an expired lease makes the job claimable again.
pub const DEFAULT_LEASE_SECS: i64 = 120;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct PipelineJob {
    #[builder(default = Uuid::new_v4())]
    pub job_id: Uuid,
    pub api_key_id: Uuid,

    #[builder(default)]
    pub status: JobStatus,
    pub params: Value,
    #[builder(default = serde_json::json!({}))]
    pub meta: Value,
    #[builder(default = 0)]
    pub progress: i32,
    #[builder(default)]
    pub current_stage: PipelineStage,
    #[builder(default, setter(strip_option))]
    pub error: Option<Value>,
    #[builder(default = false)]
    pub cancel_requested: bool,

    // Queue bookkeeping
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,
    #[builder(default = Utc::now())]
    pub next_attempt_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
}

const JOB_COLUMNS: &str = r#"
    job_id, api_key_id, status, params, meta, progress, current_stage, error,
    cancel_requested, attempts, max_attempts, next_attempt_at, lease_expires_at,
    worker_id, created_at, started_at, finished_at
"#;

impl PipelineJob {
    /// Insert the admission-created row. Generic over the executor so the
    /// idempotent submit path can run it inside a transaction.
    pub async fn insert(&self, db: impl sqlx::PgExecutor<'_>) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO pipeline_jobs (
                job_id, api_key_id, status, params, meta, progress, current_stage, error,
                cancel_requested, attempts, max_attempts, next_attempt_at, lease_expires_at,
                worker_id, created_at, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(self.job_id)
        .bind(self.api_key_id)
        .bind(self.status)
        .bind(&self.params)
        .bind(&self.meta)
        .bind(self.progress)
        .bind(self.current_stage)
        .bind(&self.error)
        .bind(self.cancel_requested)
        .bind(self.attempts)
        .bind(self.max_attempts)
        .bind(self.next_attempt_at)
        .bind(self.lease_expires_at)
        .bind(&self.worker_id)
        .bind(self.created_at)
        .bind(self.started_at)
        .bind(self.finished_at)
        .fetch_one(db)
        .await?;

        Ok(job)
    }

    pub async fn find_by_id(job_id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// Ownership-checked lookup. A mismatched owner looks exactly like a
    /// missing job.
    pub async fn find_owned(job_id: Uuid, api_key_id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE job_id = $1 AND api_key_id = $2"
        ))
        .bind(job_id)
        .bind(api_key_id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// Count pending + running jobs for the active-job cap.
    pub async fn count_active_for_key(api_key_id: Uuid, db: &PgPool) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM pipeline_jobs
            WHERE api_key_id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(api_key_id)
        .fetch_one(db)
        .await?;

        Ok(count)
    }

    /// Recent jobs for the admin inspector.
    pub async fn find_recent(
        status: Option<JobStatus>,
        limit: i64,
        db: &PgPool,
    ) -> Result<Vec<Self>> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, Self>(&format!(
                    r#"
                    SELECT {JOB_COLUMNS} FROM pipeline_jobs
                    WHERE status = $1
                    ORDER BY created_at DESC
                    LIMIT $2
                    "#
                ))
                .bind(status)
                .bind(limit)
                .fetch_all(db)
                .await?
            }
            None => {
                sqlx::query_as::<_, Self>(&format!(
                    r#"
                    SELECT {JOB_COLUMNS} FROM pipeline_jobs
                    ORDER BY created_at DESC
                    LIMIT $1
                    "#
                ))
                .bind(limit)
                .fetch_all(db)
                .await?
            }
        };

        Ok(jobs)
    }

    /// Set `cancel_requested` on a live job. Returns false when the job is
    /// already terminal (cancel is then a conflict).
    pub async fn request_cancel(job_id: Uuid, db: &PgPool) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET cancel_requested = TRUE
            WHERE job_id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(job_id)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    /// Read the cancellation signal (set flag or already-cancelled status).
    pub async fn cancel_signalled(job_id: Uuid, db: &PgPool) -> Result<bool> {
        let signalled = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT cancel_requested OR status = 'cancelled'
            FROM pipeline_jobs WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(db)
        .await?;

        Ok(signalled.unwrap_or(true))
    }

    /// Advance stage and progress. Progress is monotone: the row keeps the
    /// greater of the stored and offered values.
    pub async fn advance(
        job_id: Uuid,
        stage: PipelineStage,
        progress: i32,
        db: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET current_stage = $2, progress = GREATEST(progress, $3)
            WHERE job_id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(stage)
        .bind(progress)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Shallow-merge a patch into the meta map.
    pub async fn merge_meta(job_id: Uuid, patch: &Value, db: &PgPool) -> Result<()> {
        sqlx::query("UPDATE pipeline_jobs SET meta = meta || $2 WHERE job_id = $1")
            .bind(job_id)
            .bind(patch)
            .execute(db)
            .await?;

        Ok(())
    }

    /// Terminal transition to `completed`. No-op on already-terminal rows.
    pub async fn finish_completed(job_id: Uuid, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET status = 'completed', progress = 100, finished_at = NOW()
            WHERE job_id = $1 AND status NOT IN ('completed', 'error', 'cancelled')
            "#,
        )
        .bind(job_id)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Terminal transition to `error` with the surfaced message.
    pub async fn finish_error(job_id: Uuid, error: &Value, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET status = 'error', error = $2, progress = 100, finished_at = NOW()
            WHERE job_id = $1 AND status NOT IN ('completed', 'error', 'cancelled')
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Terminal transition to `cancelled`. A clean, non-error terminal.
    pub async fn finish_cancelled(job_id: Uuid, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET status = 'cancelled', progress = 100, finished_at = NOW()
            WHERE job_id = $1 AND status NOT IN ('completed', 'error', 'cancelled')
            "#,
        )
        .bind(job_id)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Projection served by the status endpoint.
    pub fn projection(&self) -> Value {
        serde_json::json!({
            "job_id": self.job_id,
            "status": self.status,
            "progress": self.progress,
            "current_stage": self.current_stage,
            "cancel_requested": self.cancel_requested,
            "params": self.params,
            "meta": self.meta,
            "error": self.error,
            "created_at": self.created_at,
            "started_at": self.started_at,
            "finished_at": self.finished_at,
        })
    }
}
