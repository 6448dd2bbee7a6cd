//! API key principals.
//!
//! Issuance and rotation happen out of band; the server only ever reads keys
//! by hash. A key carries its own rate-limit parameters and an admin flag
//! for the inspector endpoints.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::hash::api_key_hash;

#[derive(FromRow, Debug, Clone)]
pub struct ApiKey {
    pub id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub rate_rps: f64,
    pub burst: f64,
    pub monthly_quota: Option<i64>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Resolve a raw presented key to its principal. Revoked keys resolve to
    /// nothing, indistinguishable from unknown ones.
    pub async fn find_by_raw_key(raw_key: &str, db: &PgPool) -> Result<Option<Self>> {
        let key = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, name, key_hash, rate_rps, burst, monthly_quota, is_admin,
                   created_at, revoked_at
            FROM api_keys
            WHERE key_hash = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(api_key_hash(raw_key))
        .fetch_optional(db)
        .await?;

        Ok(key)
    }

    /// Insert a key row from an already-hashed credential (used by tests and
    /// provisioning scripts).
    pub async fn insert(
        name: &str,
        key_hash: &str,
        rate_rps: f64,
        burst: f64,
        is_admin: bool,
        db: &PgPool,
    ) -> Result<Self> {
        let key = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO api_keys (id, name, key_hash, rate_rps, burst, is_admin, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            RETURNING id, name, key_hash, rate_rps, burst, monthly_quota, is_admin,
                      created_at, revoked_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(key_hash)
        .bind(rate_rps)
        .bind(burst)
        .bind(is_admin)
        .fetch_one(db)
        .await?;

        Ok(key)
    }
}
