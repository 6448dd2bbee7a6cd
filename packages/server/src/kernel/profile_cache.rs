//! TTL cache of enriched profiles, keyed by the hash of the normalized URL.
//!
//! Written by the engine after a fetch phase, read at plan construction.
//! Shared-read across jobs; last-writer-wins on identical keys is fine.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use crate::common::hash::cache_key;
use crate::common::{normalize_profile_url, Platform};

#[derive(FromRow, Debug, Clone)]
pub struct CachedProfile {
    pub cache_key: String,
    pub normalized_url: String,
    pub platform: String,
    pub raw_data: Value,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedProfile {
    /// Bulk lookup of live entries for a set of cache keys.
    pub async fn bulk_get(keys: &[String], db: &PgPool) -> Result<Vec<Self>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let profiles = sqlx::query_as::<_, Self>(
            r#"
            SELECT cache_key, normalized_url, platform, raw_data, cached_at, expires_at
            FROM profile_cache
            WHERE cache_key = ANY($1) AND expires_at > NOW()
            "#,
        )
        .bind(keys)
        .fetch_all(db)
        .await?;

        Ok(profiles)
    }

    /// Upsert raw enriched payloads. Each entry is keyed by its normalized
    /// profile URL; entries without a usable URL are skipped.
    pub async fn put_many(
        entries: &[(String, Platform, Value)],
        ttl_days: i64,
        db: &PgPool,
    ) -> Result<u64> {
        let expires_at = Utc::now() + Duration::days(ttl_days);
        let mut written = 0u64;

        for (url, platform, raw) in entries {
            let normalized = normalize_profile_url(url);
            if normalized.is_empty() {
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO profile_cache
                    (cache_key, normalized_url, platform, raw_data, cached_at, expires_at)
                VALUES ($1, $2, $3, $4, NOW(), $5)
                ON CONFLICT (cache_key) DO UPDATE SET
                    raw_data = EXCLUDED.raw_data,
                    platform = EXCLUDED.platform,
                    cached_at = NOW(),
                    expires_at = EXCLUDED.expires_at
                "#,
            )
            .bind(cache_key(&normalized))
            .bind(&normalized)
            .bind(platform.as_str())
            .bind(raw)
            .bind(expires_at)
            .execute(db)
            .await?;
            written += 1;
        }

        Ok(written)
    }

    /// Delete expired rows; returns the number removed.
    pub async fn purge_expired(db: &PgPool) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM profile_cache WHERE expires_at <= NOW()")
            .execute(db)
            .await?
            .rows_affected();

        Ok(removed)
    }
}
