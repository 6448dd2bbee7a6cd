//! Deterministic fixture-backed providers and test data builders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use server_core::common::{hash::api_key_hash, Platform};
use server_core::kernel::providers::{
    EmbeddingProvider, EnrichmentProvider, HybridQuery, ScoringModel, SearchHit, SnapshotStatus,
    VectorIndex,
};
use server_core::kernel::ApiKey;

/// Marker planted in a profile biography to make the fixture scorer return a
/// perfect 10.
pub const PERFECT_MARKER: &str = "PERFECTFIT";

// =============================================================================
// Provider fixtures
// =============================================================================

pub struct FixtureEmbeddings;

#[async_trait]
impl EmbeddingProvider for FixtureEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.1; 8]).collect())
    }
}

/// Returns the same hit list for every hybrid query.
pub struct FixtureIndex {
    hits: Vec<SearchHit>,
}

impl FixtureIndex {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self { hits }
    }

    pub fn empty() -> Self {
        Self { hits: Vec::new() }
    }
}

#[async_trait]
impl VectorIndex for FixtureIndex {
    async fn ready(&self) -> bool {
        true
    }

    async fn hybrid_search(&self, _query: &HybridQuery) -> Result<Vec<SearchHit>> {
        Ok(self.hits.clone())
    }
}

/// In-memory enrichment provider tracking trigger/poll/download traffic.
pub struct FixtureEnrichment {
    profiles_by_url: HashMap<String, Value>,
    snapshots: Mutex<HashMap<String, Vec<String>>>,
    next_id: AtomicU32,
    pub trigger_calls: AtomicU32,
    pub fail_triggers: AtomicBool,
    pub never_ready: AtomicBool,
}

impl FixtureEnrichment {
    pub fn new(profiles: Vec<Value>) -> Self {
        let profiles_by_url = profiles
            .into_iter()
            .filter_map(|p| {
                let url = p["profile_url"].as_str()?.to_string();
                Some((url, p))
            })
            .collect();
        Self {
            profiles_by_url,
            snapshots: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            trigger_calls: AtomicU32::new(0),
            fail_triggers: AtomicBool::new(false),
            never_ready: AtomicBool::new(false),
        }
    }

    pub fn trigger_count(&self) -> u32 {
        self.trigger_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentProvider for FixtureEnrichment {
    async fn trigger(&self, urls: &[String], _platform: Platform) -> Result<String> {
        self.trigger_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_triggers.load(Ordering::SeqCst) {
            return Err(anyhow!("fixture trigger failure"));
        }
        let id = format!("snap-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.snapshots
            .lock()
            .unwrap()
            .insert(id.clone(), urls.to_vec());
        Ok(id)
    }

    async fn progress(&self, snapshot_id: &str) -> Result<SnapshotStatus> {
        if self.never_ready.load(Ordering::SeqCst) {
            return Ok(SnapshotStatus::Running);
        }
        let known = self.snapshots.lock().unwrap().contains_key(snapshot_id);
        if known {
            Ok(SnapshotStatus::Ready)
        } else {
            Ok(SnapshotStatus::Failed)
        }
    }

    async fn download(&self, snapshot_id: &str) -> Result<Vec<Value>> {
        let urls = self
            .snapshots
            .lock()
            .unwrap()
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown snapshot {snapshot_id}"))?;
        Ok(urls
            .iter()
            .filter_map(|url| self.profiles_by_url.get(url).cloned())
            .collect())
    }
}

/// Scores 10 for profiles carrying [`PERFECT_MARKER`], 6 otherwise. Also
/// serves the query-expansion call (recognized by its system prompt).
pub struct FixtureScoring;

#[async_trait]
impl ScoringModel for FixtureScoring {
    async fn complete_json(&self, system: &str, user: &str) -> Result<String> {
        if system.contains("keyword queries") {
            return Ok(json!({"queries": ["fixture query one", "fixture query two"]}).to_string());
        }

        let score = if user.contains(PERFECT_MARKER) { 10 } else { 6 };
        Ok(json!({
            "score": score,
            "rationale": "fixture rationale",
            "summary": "fixture summary",
        })
        .to_string())
    }
}

// =============================================================================
// Data builders
// =============================================================================

/// A search hit for the fixture index.
pub fn search_hit(url: &str, score: f64) -> SearchHit {
    SearchHit {
        id: Uuid::new_v4().to_string(),
        score,
        distance: Some(1.0 - score),
        profile_url: url.to_string(),
        platform: Some("instagram".to_string()),
        display_name: Some(format!("creator {url}")),
        biography: Some("bio".to_string()),
        followers: Some(25_000),
    }
}

/// A raw enrichment payload with a post from last week. `perfect` controls
/// the fixture scorer's verdict.
pub fn raw_profile(url: &str, perfect: bool) -> Value {
    let bio = if perfect {
        format!("austin coffee person {PERFECT_MARKER}")
    } else {
        "austin coffee person".to_string()
    };
    json!({
        "profile_url": url,
        "id": url,
        "full_name": format!("creator {url}"),
        "followers": 25_000,
        "biography": bio,
        "posts": [
            {
                "caption": "latte art of the day",
                "timestamp": (Utc::now() - Duration::days(5)).to_rfc3339(),
                "likes_count": 42,
            }
        ],
    })
}

/// Instagram profile URLs `https://instagram.com/creator<i>`.
pub fn profile_urls(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("https://instagram.com/creator{i}"))
        .collect()
}

/// Insert an API key and return it with its raw credential.
pub async fn create_api_key(
    pool: &PgPool,
    name: &str,
    rate_rps: f64,
    burst: f64,
    is_admin: bool,
) -> Result<(ApiKey, String)> {
    let raw_key = format!("cs_test_{}", Uuid::new_v4().simple());
    let key = ApiKey::insert(name, &api_key_hash(&raw_key), rate_rps, burst, is_admin, pool).await?;
    Ok((key, raw_key))
}

/// Seed the profile cache with payloads for the given URLs.
pub async fn seed_cache(pool: &PgPool, urls: &[String], perfect: bool) -> Result<()> {
    let entries: Vec<(String, Platform, Value)> = urls
        .iter()
        .map(|url| (url.clone(), Platform::Instagram, raw_profile(url, perfect)))
        .collect();
    server_core::kernel::CachedProfile::put_many(&entries, 14, pool).await?;
    Ok(())
}
