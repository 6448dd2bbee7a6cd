//! Stage 2: hybrid vector search.
//!
//! Keywords are embedded in one batched call (with provider fallback), then
//! every keyword × alpha combination runs as a hybrid search against the
//! index, bounded to 24 in flight. Results merge by normalized profile URL
//! keeping the highest hybrid score.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;

use crate::common::{error_chain, normalize_profile_url, Platform};
use crate::domains::pipeline::context::{fatal, RunContext, StageError, StageResult};
use crate::kernel::artifacts::{ArtifactKind, JobArtifact};
use crate::kernel::events::EventLevel;
use crate::kernel::jobs::PipelineStage;
use crate::kernel::providers::{HybridQuery, SearchHit, TargetWeights};

const STAGE: &str = "vector_search";

/// Hybrid dense/lexical mixes fanned out per keyword.
pub const ALPHAS: [f64; 2] = [0.5, 0.75];

/// Global in-flight bound for index searches.
pub const MAX_CONCURRENT_SEARCHES: usize = 24;

/// A vector-search result with preview fields, pre-enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub score: f64,
    pub distance: Option<f64>,
    pub profile_url: String,
    pub platform: Platform,
    pub display_name: Option<String>,
    pub biography: Option<String>,
    pub followers: Option<i64>,
}

/// Per-search result cap: `max(500, ceil(1.25 * weaviate_top_n / keywords))`.
pub fn per_search_limit(weaviate_top_n: u32, keyword_count: usize) -> u32 {
    let spread = (weaviate_top_n as f64 * 1.25 / keyword_count.max(1) as f64).ceil() as u32;
    spread.max(500)
}

/// Case-insensitive keyword dedup, first occurrence wins.
pub fn dedupe_keywords(keywords: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    keywords
        .iter()
        .filter(|k| seen.insert(k.to_ascii_lowercase()))
        .cloned()
        .collect()
}

/// Drop excluded profiles (case-insensitive normalized URL match), then trim
/// back down to the intended per-search limit.
pub fn filter_exclusions(
    hits: Vec<SearchHit>,
    exclusions: &HashSet<String>,
    limit: usize,
) -> Vec<SearchHit> {
    let mut kept: Vec<SearchHit> = hits
        .into_iter()
        .filter(|hit| !exclusions.contains(&normalize_profile_url(&hit.profile_url)))
        .collect();
    kept.truncate(limit);
    kept
}

/// Merge hits across searches: one candidate per normalized URL, keeping the
/// entry with the highest hybrid score, sorted descending.
pub fn merge_hits(all_hits: Vec<SearchHit>, top_n: usize) -> Vec<Candidate> {
    let mut best: HashMap<String, SearchHit> = HashMap::new();
    for hit in all_hits {
        let key = normalize_profile_url(&hit.profile_url);
        match best.get(&key) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(key, hit);
            }
        }
    }

    let mut merged: Vec<Candidate> = best
        .into_iter()
        .map(|(normalized_url, hit)| Candidate {
            id: hit.id,
            score: hit.score,
            distance: hit.distance,
            platform: hit
                .platform
                .as_deref()
                .and_then(Platform::parse)
                .unwrap_or_else(|| Platform::from_url(&normalized_url)),
            profile_url: normalized_url,
            display_name: hit.display_name,
            biography: hit.biography,
            followers: hit.followers,
        })
        .collect();

    merged.sort_by(|a, b| b.score.total_cmp(&a.score));
    merged.truncate(top_n);
    merged
}

pub async fn run(ctx: &RunContext, keywords: &[String]) -> StageResult<Vec<Candidate>> {
    ctx.check_cancelled().await?;
    ctx.wf_start(STAGE);
    ctx.advance(PipelineStage::VectorSearch, 10).await?;
    ctx.event(EventLevel::Info, "stage_started", json!({"stage": STAGE}))
        .await?;

    let keywords = dedupe_keywords(keywords);

    // One batched embedding call; the provider chain falls back internally.
    ctx.wf_start("embeddings");
    let vectors = ctx
        .kernel
        .embeddings
        .embed_batch(&keywords)
        .await
        .map_err(|e| fatal(STAGE, error_chain(&e)))?;
    ctx.wf_end("embeddings");
    ctx.advance(PipelineStage::VectorSearch, 20).await?;
    ctx.event(
        EventLevel::Info,
        "embeddings_ready",
        json!({"keywords": keywords.len()}),
    )
    .await?;

    let exclusions: HashSet<String> = ctx
        .params
        .exclude_profile_urls
        .iter()
        .map(|u| normalize_profile_url(u))
        .collect();

    let base_limit = per_search_limit(ctx.params.weaviate_top_n, keywords.len());
    let fetch_limit = if exclusions.is_empty() {
        base_limit
    } else {
        // Over-fetch so client-side exclusion filtering can't starve the page
        base_limit + exclusions.len() as u32
    };

    ctx.check_cancelled().await?;
    ctx.wf_start("index_searches");
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_SEARCHES));
    let mut searches = Vec::with_capacity(keywords.len() * ALPHAS.len());
    for (keyword, vector) in keywords.iter().zip(vectors.iter()) {
        for alpha in ALPHAS {
            let semaphore = semaphore.clone();
            let query = HybridQuery {
                query: keyword.clone(),
                vector: vector.clone(),
                alpha,
                limit: fetch_limit,
                platform: ctx.params.platform.map(|p| p.as_str().to_string()),
                min_followers: ctx.params.min_followers,
                max_followers: ctx.params.max_followers,
                target_weights: TargetWeights::default(),
            };
            searches.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                ctx.kernel.vector_index.hybrid_search(&query).await
            });
        }
    }

    let mut all_hits = Vec::new();
    for result in futures::future::join_all(searches).await {
        let hits = result.map_err(|e| fatal(STAGE, error_chain(&e)))?;
        all_hits.extend(filter_exclusions(hits, &exclusions, base_limit as usize));
    }
    ctx.wf_end("index_searches");

    let candidates = merge_hits(all_hits, ctx.params.weaviate_top_n as usize);
    ctx.counters().candidates_found = candidates.len() as u32;

    let data = serde_json::to_value(&candidates).map_err(anyhow::Error::from)?;
    JobArtifact::upsert(ctx.job_id, ArtifactKind::Candidates, &data, ctx.db())
        .await
        .map_err(StageError::Infra)?;

    ctx.merge_meta(json!({
        "vector_search_status": "completed",
        "searches_run": keywords.len() * ALPHAS.len(),
        "candidates_found": candidates.len(),
    }))
    .await?;
    ctx.advance(PipelineStage::VectorSearch, 50).await?;
    ctx.event(
        EventLevel::Info,
        "candidates_ready",
        json!({"count": candidates.len()}),
    )
    .await?;
    ctx.wf_end(STAGE);

    Ok(candidates)
}
