//! Per-job artifact blobs, upserted idempotently on `(job_id, kind)`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Recognized artifact kinds. `Batch(n)` is keyed `batch:N` so merges stay
/// deterministic regardless of snapshot completion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Candidates,
    Batch(u32),
    Progressive,
    Final,
    Remaining,
    Timing,
}

impl ArtifactKind {
    pub fn as_string(&self) -> String {
        match self {
            ArtifactKind::Candidates => "candidates".to_string(),
            ArtifactKind::Batch(n) => format!("batch:{n}"),
            ArtifactKind::Progressive => "progressive".to_string(),
            ArtifactKind::Final => "final".to_string(),
            ArtifactKind::Remaining => "remaining".to_string(),
            ArtifactKind::Timing => "timing".to_string(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "candidates" => Some(ArtifactKind::Candidates),
            "progressive" => Some(ArtifactKind::Progressive),
            "final" => Some(ArtifactKind::Final),
            "remaining" => Some(ArtifactKind::Remaining),
            "timing" => Some(ArtifactKind::Timing),
            other => other
                .strip_prefix("batch:")
                .and_then(|n| n.parse().ok())
                .map(ArtifactKind::Batch),
        }
    }

    /// Kinds a client may fetch through the artifact endpoint. `final` goes
    /// through the results endpoint and batch artifacts stay internal.
    pub fn client_fetchable(&self) -> bool {
        matches!(
            self,
            ArtifactKind::Candidates
                | ArtifactKind::Progressive
                | ArtifactKind::Remaining
                | ArtifactKind::Timing
        )
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct JobArtifact {
    pub job_id: Uuid,
    pub kind: String,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

impl JobArtifact {
    /// Idempotent upsert; `updated_at` never moves backwards.
    pub async fn upsert(job_id: Uuid, kind: ArtifactKind, data: &Value, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_job_artifacts (job_id, kind, data, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (job_id, kind) DO UPDATE SET
                data = EXCLUDED.data,
                updated_at = GREATEST(pipeline_job_artifacts.updated_at, NOW())
            "#,
        )
        .bind(job_id)
        .bind(kind.as_string())
        .bind(data)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn get(job_id: Uuid, kind: ArtifactKind, db: &PgPool) -> Result<Option<Self>> {
        let artifact = sqlx::query_as::<_, Self>(
            r#"
            SELECT job_id, kind, data, updated_at
            FROM pipeline_job_artifacts
            WHERE job_id = $1 AND kind = $2
            "#,
        )
        .bind(job_id)
        .bind(kind.as_string())
        .fetch_optional(db)
        .await?;

        Ok(artifact)
    }

    /// All `batch:N` artifacts ordered by batch index.
    pub async fn list_batches(job_id: Uuid, db: &PgPool) -> Result<Vec<(u32, Value)>> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT job_id, kind, data, updated_at
            FROM pipeline_job_artifacts
            WHERE job_id = $1 AND kind LIKE 'batch:%'
            "#,
        )
        .bind(job_id)
        .fetch_all(db)
        .await?;

        let mut batches: Vec<(u32, Value)> = rows
            .into_iter()
            .filter_map(|row| match ArtifactKind::parse(&row.kind) {
                Some(ArtifactKind::Batch(n)) => Some((n, row.data)),
                _ => None,
            })
            .collect();
        batches.sort_by_key(|(n, _)| *n);

        Ok(batches)
    }
}
