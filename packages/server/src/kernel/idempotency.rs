//! Idempotency-key store: `(api_key, token) → job_id` with a 24h TTL.
//!
//! The mapping is reserved in the same transaction that inserts the job row
//! (`put` is generic over the executor for exactly that), so a stored key
//! always points at a real job and a racing submit can never leave an
//! orphaned job behind.

use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

pub const IDEMPOTENCY_TTL_HOURS: i64 = 24;

pub struct IdempotencyKey;

impl IdempotencyKey {
    /// Look up a live mapping.
    pub async fn get(api_key_id: Uuid, idem_key: &str, db: &PgPool) -> Result<Option<Uuid>> {
        let job_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT job_id FROM idempotency_keys
            WHERE api_key_id = $1 AND idem_key = $2 AND expires_at > NOW()
            "#,
        )
        .bind(api_key_id)
        .bind(idem_key)
        .fetch_optional(db)
        .await?;

        Ok(job_id)
    }

    /// Reserve (or read) the mapping for this key. The first writer wins and
    /// every caller gets the stored job id back; expired mappings are
    /// replaced. The row lock taken by the upsert serializes racing submits,
    /// so a caller whose candidate id was stored owns job creation, and one
    /// whose wasn't must not create a job.
    pub async fn put(
        api_key_id: Uuid,
        idem_key: &str,
        job_id: Uuid,
        db: impl sqlx::PgExecutor<'_>,
    ) -> Result<Uuid> {
        let expires_at = Utc::now() + Duration::hours(IDEMPOTENCY_TTL_HOURS);

        let stored = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO idempotency_keys (api_key_id, idem_key, job_id, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (api_key_id, idem_key) DO UPDATE SET
                -- refresh only if the previous mapping already expired
                job_id = CASE
                    WHEN idempotency_keys.expires_at <= NOW() THEN EXCLUDED.job_id
                    ELSE idempotency_keys.job_id
                END,
                expires_at = CASE
                    WHEN idempotency_keys.expires_at <= NOW() THEN EXCLUDED.expires_at
                    ELSE idempotency_keys.expires_at
                END
            RETURNING job_id
            "#,
        )
        .bind(api_key_id)
        .bind(idem_key)
        .bind(job_id)
        .bind(expires_at)
        .fetch_one(db)
        .await?;

        Ok(stored)
    }

    /// Delete expired rows; returns the number removed.
    pub async fn purge_expired(db: &PgPool) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= NOW()")
            .execute(db)
            .await?
            .rows_affected();

        Ok(removed)
    }
}
