//! Ledger of outbound provider invocations, powering the admin cost view.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct ExternalCall {
    pub id: i64,
    pub job_id: Uuid,
    pub api_key_id: Uuid,
    pub service: String,
    pub operation: String,
    pub ts: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: String,
    pub cost_usd: f64,
    pub meta: Value,
}

impl ExternalCall {
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        job_id: Uuid,
        api_key_id: Uuid,
        service: &str,
        operation: &str,
        duration_ms: i64,
        status: &str,
        cost_usd: f64,
        meta: Value,
        db: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO external_calls
                (job_id, api_key_id, service, operation, ts, duration_ms, status, cost_usd, meta)
            VALUES ($1, $2, $3, $4, NOW(), $5, $6, $7, $8)
            "#,
        )
        .bind(job_id)
        .bind(api_key_id)
        .bind(service)
        .bind(operation)
        .bind(duration_ms)
        .bind(status)
        .bind(cost_usd)
        .bind(meta)
        .execute(db)
        .await?;

        Ok(())
    }
}

/// Per-service aggregation for the admin usage view.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct ServiceUsage {
    pub service: String,
    pub calls: i64,
    pub total_duration_ms: i64,
    pub total_cost_usd: f64,
}

impl ServiceUsage {
    pub async fn since(since: DateTime<Utc>, db: &PgPool) -> Result<Vec<Self>> {
        let usage = sqlx::query_as::<_, Self>(
            r#"
            SELECT service,
                   COUNT(*) AS calls,
                   COALESCE(SUM(duration_ms), 0)::bigint AS total_duration_ms,
                   COALESCE(SUM(cost_usd), 0)::float8 AS total_cost_usd
            FROM external_calls
            WHERE ts >= $1
            GROUP BY service
            ORDER BY total_cost_usd DESC
            "#,
        )
        .bind(since)
        .fetch_all(db)
        .await?;

        Ok(usage)
    }
}
