//! Server-side token bucket, one row per `(principal, scope)`.
//!
//! The refill and conditional decrement happen in a single upsert so
//! concurrent callers on the same key serialize on the row lock. Idle
//! buckets carry a TTL and are swept by the cleanup task.

use anyhow::Result;
use chrono::Utc;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Minimum bucket row lifetime; refreshed on every touch.
pub const BUCKET_TTL_MINUTES: i64 = 10;

/// Outcome of a bucket check.
#[derive(FromRow, Debug, Clone, Copy)]
pub struct RateLimitDecision {
    #[sqlx(rename = "last_allowed")]
    pub allowed: bool,
    #[sqlx(rename = "tokens")]
    pub remaining: f64,
}

pub struct RateLimiter;

impl RateLimiter {
    /// Refill the bucket to `min(burst, tokens + elapsed_secs * rate)` and
    /// consume one token when at least one is available. Atomic against
    /// concurrent callers on the same key.
    pub async fn check(
        api_key_id: Uuid,
        scope: &str,
        rate_per_second: f64,
        burst: f64,
        db: &PgPool,
    ) -> Result<RateLimitDecision> {
        let bucket_key = format!("{api_key_id}:{scope}");
        let now_ms = Utc::now().timestamp_millis();

        let decision = sqlx::query_as::<_, RateLimitDecision>(
            r#"
            INSERT INTO rate_limit_buckets AS b
                (bucket_key, tokens, last_refill_ms, last_allowed, expires_at)
            VALUES
                ($1, GREATEST($2 - 1, 0), $3, $2 >= 1, NOW() + ($5 || ' minutes')::INTERVAL)
            ON CONFLICT (bucket_key) DO UPDATE SET
                last_allowed =
                    LEAST($2, b.tokens + GREATEST($3 - b.last_refill_ms, 0)::float8 / 1000.0 * $4) >= 1,
                tokens = CASE
                    WHEN LEAST($2, b.tokens + GREATEST($3 - b.last_refill_ms, 0)::float8 / 1000.0 * $4) >= 1
                    THEN LEAST($2, b.tokens + GREATEST($3 - b.last_refill_ms, 0)::float8 / 1000.0 * $4) - 1
                    ELSE LEAST($2, b.tokens + GREATEST($3 - b.last_refill_ms, 0)::float8 / 1000.0 * $4)
                END,
                last_refill_ms = $3,
                expires_at = NOW() + ($5 || ' minutes')::INTERVAL
            RETURNING last_allowed, tokens
            "#,
        )
        .bind(&bucket_key)
        .bind(burst)
        .bind(now_ms)
        .bind(rate_per_second)
        .bind(BUCKET_TTL_MINUTES.to_string())
        .fetch_one(db)
        .await?;

        Ok(decision)
    }

    /// Delete expired buckets; returns the number removed.
    pub async fn purge_expired(db: &PgPool) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM rate_limit_buckets WHERE expires_at <= NOW()")
            .execute(db)
            .await?
            .rows_affected();

        Ok(removed)
    }
}
