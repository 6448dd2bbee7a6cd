//! Append-only job event log.
//!
//! Events are only ever appended; the `bigserial` id is the canonical cursor
//! for both batched polling and SSE streaming. Readers polling with
//! `id > after` get a prefix-consistent, ascending view.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "event_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: Uuid,
    pub ts: DateTime<Utc>,
    pub level: EventLevel,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

impl JobEvent {
    /// Append an event; returns the assigned cursor id.
    pub async fn append(
        job_id: Uuid,
        level: EventLevel,
        event_type: &str,
        data: Value,
        db: &PgPool,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pipeline_job_events (job_id, ts, level, type, data)
            VALUES ($1, NOW(), $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(job_id)
        .bind(level)
        .bind(event_type)
        .bind(data)
        .fetch_one(db)
        .await?;

        Ok(id)
    }

    /// Events with `id > after` in ascending id order, up to `limit`.
    pub async fn list_after(
        job_id: Uuid,
        after: i64,
        limit: i64,
        db: &PgPool,
    ) -> Result<Vec<Self>> {
        let events = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_id, ts, level, type, data
            FROM pipeline_job_events
            WHERE job_id = $1 AND id > $2
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(job_id)
        .bind(after)
        .bind(limit)
        .fetch_all(db)
        .await?;

        Ok(events)
    }
}
