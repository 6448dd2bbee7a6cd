//! Stage 3/4: cache-first enrichment fan-out with interleaved scoring.
//!
//! The plan is built up front so `total_batches` stays stable for progress
//! reporting: cache hits are grouped by platform and chunked first, uncached
//! URLs after them. Phase A processes cache batches sequentially and can
//! satisfy the run outright; Phase B triggers provider snapshots with at
//! most five in flight, ages out stuck snapshots, tops up free slots before
//! downloading so trigger and download latency overlap, and processes ready
//! snapshots strictly sequentially because scoring concurrency is a global
//! cap.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

use crate::common::hash::cache_key;
use crate::common::{error_chain, Platform};
use crate::domains::pipeline::context::{fatal, RunContext, StageError, StageResult};
use crate::domains::pipeline::normalize::{normalize_profile, NormalizedProfile};
use crate::domains::pipeline::stages::scoring::{self, GOOD_FIT_THRESHOLD};
use crate::domains::pipeline::stages::vector_search::Candidate;
use crate::kernel::artifacts::{ArtifactKind, JobArtifact};
use crate::kernel::events::EventLevel;
use crate::kernel::jobs::PipelineStage;
use crate::kernel::profile_cache::CachedProfile;
use crate::kernel::providers::SnapshotStatus;

const STAGE: &str = "enrichment";

/// Profiles per enrichment + scoring unit.
pub const BATCH_SIZE: usize = 20;

/// Snapshot fan-out bound.
pub const MAX_IN_FLIGHT: usize = 5;

/// Pause between snapshot progress sweeps.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Per-snapshot lifetime once triggered.
pub const BATCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Whole-stage guard.
pub const STAGE_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub enum BatchSource {
    /// Raw payloads already present in the profile cache
    Cache(Vec<Value>),
    /// Profile URLs that need a provider snapshot
    Fetch(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct PlannedBatch {
    pub index: u32,
    pub platform: Platform,
    pub source: BatchSource,
}

/// A triggered snapshot being tracked.
struct InFlight {
    batch_index: u32,
    platform: Platform,
    url_count: usize,
    triggered_at: Instant,
}

/// Classify candidates against the cache and chunk them into batches with
/// stable indices: cache batches first, fetch batches after, both grouped by
/// platform in a fixed order.
pub fn build_plan(
    candidates: &[Candidate],
    cached: &HashMap<String, Value>,
) -> Vec<PlannedBatch> {
    const PLATFORM_ORDER: [Platform; 3] =
        [Platform::Instagram, Platform::Tiktok, Platform::Unknown];

    let mut cache_groups: HashMap<Platform, Vec<Value>> = HashMap::new();
    let mut fetch_groups: HashMap<Platform, Vec<String>> = HashMap::new();

    for candidate in candidates {
        let platform = match candidate.platform {
            Platform::Unknown => Platform::from_url(&candidate.profile_url),
            known => known,
        };
        match cached.get(&candidate.profile_url) {
            Some(raw) => cache_groups
                .entry(platform)
                .or_default()
                .push(raw.clone()),
            None => fetch_groups
                .entry(platform)
                .or_default()
                .push(candidate.profile_url.clone()),
        }
    }

    let mut plan = Vec::new();
    let mut index = 0u32;

    for platform in PLATFORM_ORDER {
        if let Some(payloads) = cache_groups.remove(&platform) {
            for chunk in payloads.chunks(BATCH_SIZE) {
                plan.push(PlannedBatch {
                    index,
                    platform,
                    source: BatchSource::Cache(chunk.to_vec()),
                });
                index += 1;
            }
        }
    }
    for platform in PLATFORM_ORDER {
        if let Some(urls) = fetch_groups.remove(&platform) {
            for chunk in urls.chunks(BATCH_SIZE) {
                plan.push(PlannedBatch {
                    index,
                    platform,
                    source: BatchSource::Fetch(chunk.to_vec()),
                });
                index += 1;
            }
        }
    }

    plan
}

/// Flatten `batch:N` artifacts (already in index order) and sort by fit
/// descending. The stable sort keeps merges deterministic across runs.
pub fn merge_scored_batches(batches: Vec<(u32, Value)>) -> Vec<Value> {
    let mut profiles: Vec<Value> = batches
        .into_iter()
        .filter_map(|(_, data)| data.as_array().cloned())
        .flatten()
        .collect();

    profiles.sort_by_key(|p| std::cmp::Reverse(p["fit_score"].as_i64().unwrap_or(0)));
    profiles
}

pub async fn run(ctx: &RunContext, candidates: &[Candidate]) -> StageResult<()> {
    ctx.check_cancelled().await?;
    ctx.wf_start(STAGE);
    ctx.advance(PipelineStage::Enrichment, 50).await?;
    ctx.event(EventLevel::Info, "stage_started", json!({"stage": STAGE}))
        .await?;

    // Bulk cache lookup at plan time
    let keys: Vec<String> = candidates
        .iter()
        .map(|c| cache_key(&c.profile_url))
        .collect();
    let hits = CachedProfile::bulk_get(&keys, ctx.db())
        .await
        .map_err(StageError::Infra)?;
    let cached: HashMap<String, Value> = hits
        .into_iter()
        .map(|hit| (hit.normalized_url, hit.raw_data))
        .collect();

    let cache_hits = candidates
        .iter()
        .filter(|c| cached.contains_key(&c.profile_url))
        .count() as u32;

    let plan = build_plan(candidates, &cached);
    let total_batches = plan.len() as u32;
    let (cache_batches, fetch_batches): (Vec<_>, Vec<_>) = plan
        .into_iter()
        .partition(|b| matches!(b.source, BatchSource::Cache(_)));

    {
        let mut counters = ctx.counters();
        counters.total_batches = total_batches;
        counters.cache_hits = cache_hits;
    }
    ctx.merge_meta(json!({
        "enrichment_status": "running",
        "total_batches": total_batches,
        "cache_hits": cache_hits,
    }))
    .await?;
    ctx.event(
        EventLevel::Info,
        "enrichment_plan",
        json!({
            "total_batches": total_batches,
            "cache_batches": cache_batches.len(),
            "fetch_batches": fetch_batches.len(),
        }),
    )
    .await?;

    let target_good = ctx.params.llm_top_n;

    // Phase A: cache batches, sequential
    for batch in cache_batches {
        let BatchSource::Cache(payloads) = batch.source else {
            continue;
        };
        process_batch(ctx, batch.index, batch.platform, payloads, true).await?;
    }

    let good_after_cache = ctx.counters().good_found;
    if good_after_cache >= target_good {
        ctx.event(
            EventLevel::Info,
            "adaptive_stop",
            json!({"phase": "cache", "good_found": good_after_cache}),
        )
        .await?;
    } else if !fetch_batches.is_empty() {
        run_fetch_phase(ctx, fetch_batches, target_good).await?;
    }

    let completed = ctx.counters().batches_completed;
    if total_batches > 0 && completed == 0 {
        return Err(fatal(STAGE, "all enrichment batches failed"));
    }

    ctx.merge_meta(json!({"enrichment_status": "completed"}))
        .await?;
    ctx.wf_end(STAGE);
    Ok(())
}

/// Phase B: bounded snapshot fan-out over the uncached batches.
async fn run_fetch_phase(
    ctx: &RunContext,
    fetch_batches: Vec<PlannedBatch>,
    target_good: u32,
) -> StageResult<()> {
    let mut pending: VecDeque<PlannedBatch> = fetch_batches.into();
    let mut in_flight: HashMap<String, InFlight> = HashMap::new();
    let mut stop_topping_up = false;
    let phase_started = Instant::now();

    loop {
        let good_found = ctx.counters().good_found;
        if !stop_topping_up && good_found >= target_good {
            stop_topping_up = true;
            ctx.event(
                EventLevel::Info,
                "adaptive_stop",
                json!({"phase": "fetch", "good_found": good_found}),
            )
            .await?;
        }

        top_up(ctx, &mut pending, &mut in_flight, stop_topping_up).await?;

        if in_flight.is_empty() && (pending.is_empty() || stop_topping_up) {
            break;
        }

        if phase_started.elapsed() >= STAGE_TIMEOUT {
            tracing::warn!(job_id = %ctx.job_id, "enrichment stage timeout, abandoning remaining batches");
            let abandoned = in_flight.len() + pending.len();
            let batches_failed = {
                let mut counters = ctx.counters();
                counters.batches_failed += abandoned as u32;
                counters.batches_failed
            };
            ctx.merge_meta(json!({"batches_failed": batches_failed}))
                .await?;
            ctx.event(
                EventLevel::Warn,
                "enrichment_timeout",
                json!({"abandoned_batches": abandoned}),
            )
            .await?;
            break;
        }

        // Poll every in-flight snapshot in parallel
        ctx.check_cancelled().await?;
        let ids: Vec<String> = in_flight.keys().cloned().collect();
        let polls = ids.into_iter().map(|id| async move {
            let status = ctx.kernel.enrichment.progress(&id).await;
            (id, status)
        });
        let polled = futures::future::join_all(polls).await;

        let mut ready = Vec::new();
        for (snapshot_id, status) in polled {
            match status {
                Ok(SnapshotStatus::Ready) => {
                    ready.push(snapshot_id);
                    continue;
                }
                Ok(SnapshotStatus::Failed) => {
                    fail_snapshot(ctx, &mut in_flight, &snapshot_id, "snapshot failed").await?;
                    continue;
                }
                Ok(SnapshotStatus::Running) => {}
                Err(e) => {
                    tracing::warn!(snapshot_id, error = %e, "snapshot progress check failed");
                }
            }

            // Still running (or unknown): age out stuck snapshots
            let timed_out = in_flight
                .get(&snapshot_id)
                .is_some_and(|s| s.triggered_at.elapsed() >= BATCH_TIMEOUT);
            if timed_out {
                fail_snapshot(ctx, &mut in_flight, &snapshot_id, "snapshot timed out").await?;
            }
        }

        // Top up freed slots before downloading so trigger latency overlaps
        // download + scoring latency
        top_up(ctx, &mut pending, &mut in_flight, stop_topping_up).await?;

        // Ready snapshots are processed strictly sequentially: scoring
        // concurrency is a global cap, not a per-batch one
        let downloaded_any = !ready.is_empty();
        for snapshot_id in ready {
            let Some(snapshot) = in_flight.remove(&snapshot_id) else {
                continue;
            };
            ctx.check_cancelled().await?;

            match ctx.kernel.enrichment.download(&snapshot_id).await {
                Ok(payloads) => {
                    tracing::debug!(
                        snapshot_id,
                        batch = snapshot.batch_index,
                        urls = snapshot.url_count,
                        profiles = payloads.len(),
                        "snapshot downloaded"
                    );
                    process_batch(ctx, snapshot.batch_index, snapshot.platform, payloads, false)
                        .await?;
                }
                Err(e) => {
                    let batches_failed = {
                        let mut counters = ctx.counters();
                        counters.batches_failed += 1;
                        counters.batches_failed
                    };
                    ctx.merge_meta(json!({"batches_failed": batches_failed}))
                        .await?;
                    tracing::warn!(snapshot_id, error = %e, "snapshot download failed");
                    ctx.event(
                        EventLevel::Warn,
                        "batch_failed",
                        json!({
                            "batch": snapshot.batch_index,
                            "reason": "download_failed",
                            "error": error_chain(&e),
                        }),
                    )
                    .await?;
                }
            }
        }

        if !downloaded_any {
            ctx.sleep_cancellable(POLL_INTERVAL).await?;
        }
    }

    Ok(())
}

/// Trigger pending batches until the in-flight bound is reached.
async fn top_up(
    ctx: &RunContext,
    pending: &mut VecDeque<PlannedBatch>,
    in_flight: &mut HashMap<String, InFlight>,
    stop_topping_up: bool,
) -> StageResult<()> {
    while !stop_topping_up && in_flight.len() < MAX_IN_FLIGHT {
        let Some(batch) = pending.pop_front() else {
            break;
        };
        let BatchSource::Fetch(urls) = &batch.source else {
            continue;
        };

        ctx.check_cancelled().await?;
        match ctx.kernel.enrichment.trigger(urls, batch.platform).await {
            Ok(snapshot_id) => {
                ctx.event(
                    EventLevel::Info,
                    "batch_triggered",
                    json!({
                        "batch": batch.index,
                        "snapshot_id": snapshot_id,
                        "urls": urls.len(),
                        "platform": batch.platform,
                    }),
                )
                .await?;
                in_flight.insert(
                    snapshot_id,
                    InFlight {
                        batch_index: batch.index,
                        platform: batch.platform,
                        url_count: urls.len(),
                        triggered_at: Instant::now(),
                    },
                );
            }
            Err(e) => {
                let batches_failed = {
                    let mut counters = ctx.counters();
                    counters.batches_failed += 1;
                    counters.batches_failed
                };
                ctx.merge_meta(json!({"batches_failed": batches_failed}))
                    .await?;
                tracing::warn!(batch = batch.index, error = %e, "batch trigger failed");
                ctx.event(
                    EventLevel::Warn,
                    "batch_failed",
                    json!({
                        "batch": batch.index,
                        "reason": "trigger_failed",
                        "error": error_chain(&e),
                    }),
                )
                .await?;
            }
        }
    }
    Ok(())
}

/// Drop a snapshot from tracking and count the failure.
async fn fail_snapshot(
    ctx: &RunContext,
    in_flight: &mut HashMap<String, InFlight>,
    snapshot_id: &str,
    reason: &str,
) -> StageResult<()> {
    let Some(snapshot) = in_flight.remove(snapshot_id) else {
        return Ok(());
    };
    let batches_failed = {
        let mut counters = ctx.counters();
        counters.batches_failed += 1;
        counters.batches_failed
    };
    ctx.merge_meta(json!({"batches_failed": batches_failed}))
        .await?;
    tracing::warn!(snapshot_id, batch = snapshot.batch_index, reason, "snapshot dropped");
    ctx.event(
        EventLevel::Warn,
        "batch_failed",
        json!({"batch": snapshot.batch_index, "reason": reason}),
    )
    .await?;
    Ok(())
}

/// The per-batch routine shared by Phase A and ready Phase B snapshots:
/// normalize, score, publish `batch:N`, recompute `progressive`, update
/// counters, and (for fetched batches) write the cache back.
async fn process_batch(
    ctx: &RunContext,
    index: u32,
    platform: Platform,
    payloads: Vec<Value>,
    from_cache: bool,
) -> StageResult<()> {
    ctx.check_cancelled().await?;
    let wf_name = format!("batch:{index}");
    ctx.wf_start(&wf_name);

    let profiles: Vec<NormalizedProfile> = payloads
        .iter()
        .filter_map(|raw| normalize_profile(raw, platform))
        .collect();

    let scored = scoring::score_batch(ctx, profiles).await;
    let good_in_batch = scored
        .iter()
        .filter(|s| s.fit_score >= GOOD_FIT_THRESHOLD)
        .count() as u32;

    let data = serde_json::to_value(&scored).map_err(anyhow::Error::from)?;
    JobArtifact::upsert(ctx.job_id, ArtifactKind::Batch(index), &data, ctx.db())
        .await
        .map_err(StageError::Infra)?;

    // Recompute the progressive ranking from every published batch
    let batches = JobArtifact::list_batches(ctx.job_id, ctx.db())
        .await
        .map_err(StageError::Infra)?;
    let mut merged = merge_scored_batches(batches);
    merged.truncate(ctx.params.llm_top_n as usize);
    JobArtifact::upsert(
        ctx.job_id,
        ArtifactKind::Progressive,
        &json!({"profiles": merged, "is_complete": false}),
        ctx.db(),
    )
    .await
    .map_err(StageError::Infra)?;

    let (batches_completed, total_batches, counters_patch) = {
        let mut counters = ctx.counters();
        counters.batches_completed += 1;
        counters.good_found += good_in_batch;
        counters.profiles_analyzed += scored.len() as u32;
        if !from_cache {
            // Cost accounting counts profiles returned by the provider
            counters.api_calls += payloads.len() as u32;
        }
        (
            counters.batches_completed,
            counters.total_batches,
            json!({
                "batches_completed": counters.batches_completed,
                "batches_failed": counters.batches_failed,
                "good_found": counters.good_found,
                "profiles_analyzed": counters.profiles_analyzed,
                "api_calls": counters.api_calls,
            }),
        )
    };
    ctx.merge_meta(counters_patch).await?;
    ctx.advance(
        PipelineStage::Enrichment,
        batch_progress(batches_completed, total_batches),
    )
    .await?;
    ctx.event(
        EventLevel::Info,
        "batch_scored",
        json!({
            "batch": index,
            "profiles": scored.len(),
            "good": good_in_batch,
            "from_cache": from_cache,
        }),
    )
    .await?;

    // Fetched payloads flow back into the cache, best-effort
    if !from_cache {
        let entries: Vec<(String, Platform, Value)> = payloads
            .iter()
            .filter_map(|raw| {
                normalize_profile(raw, platform)
                    .map(|p| (p.profile_url, p.platform, raw.clone()))
            })
            .collect();
        let ttl_days = ctx.kernel.config.cache_ttl_days;
        let db = ctx.db().clone();
        let job_id = ctx.job_id;
        tokio::spawn(async move {
            if let Err(e) = CachedProfile::put_many(&entries, ttl_days, &db).await {
                tracing::warn!(job_id = %job_id, error = %e, "profile cache write-back failed");
            }
        });
    }

    ctx.wf_end(&wf_name);
    Ok(())
}

/// Progress through the interleaved phase: 50% at the start, 95% cap until
/// finalization takes it to 100.
pub fn batch_progress(completed: u32, total: u32) -> i32 {
    if total == 0 {
        return 95;
    }
    let span = 45.0 * completed as f64 / total as f64;
    (50 + span.round() as i32).min(95)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(url: &str, platform: Platform) -> Candidate {
        Candidate {
            id: url.to_string(),
            score: 0.5,
            distance: None,
            profile_url: crate::common::normalize_profile_url(url),
            platform,
            display_name: None,
            biography: None,
            followers: Some(1000),
        }
    }

    fn cached_payload(url: &str) -> Value {
        json!({"profile_url": url, "followers": 100, "posts": []})
    }

    #[test]
    fn plan_separates_cache_and_fetch_batches() {
        let candidates = vec![
            candidate("https://instagram.com/a", Platform::Instagram),
            candidate("https://instagram.com/b", Platform::Instagram),
            candidate("https://tiktok.com/@c", Platform::Tiktok),
        ];
        let cached = HashMap::from([(
            "https://instagram.com/a".to_string(),
            cached_payload("https://instagram.com/a"),
        )]);

        let plan = build_plan(&candidates, &cached);
        assert_eq!(plan.len(), 3);

        assert!(matches!(plan[0].source, BatchSource::Cache(_)));
        assert_eq!(plan[0].platform, Platform::Instagram);

        assert!(matches!(plan[1].source, BatchSource::Fetch(_)));
        assert_eq!(plan[1].platform, Platform::Instagram);
        assert!(matches!(plan[2].source, BatchSource::Fetch(_)));
        assert_eq!(plan[2].platform, Platform::Tiktok);

        let indices: Vec<u32> = plan.iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![0, 1, 2], "indices are stable and dense");
    }

    #[test]
    fn plan_chunks_batches_of_twenty() {
        let candidates: Vec<Candidate> = (0..45)
            .map(|i| candidate(&format!("https://instagram.com/u{i}"), Platform::Instagram))
            .collect();
        let plan = build_plan(&candidates, &HashMap::new());

        assert_eq!(plan.len(), 3);
        let sizes: Vec<usize> = plan
            .iter()
            .map(|b| match &b.source {
                BatchSource::Fetch(urls) => urls.len(),
                BatchSource::Cache(payloads) => payloads.len(),
            })
            .collect();
        assert_eq!(sizes, vec![20, 20, 5]);
    }

    #[test]
    fn cached_urls_never_land_in_fetch_batches() {
        let candidates: Vec<Candidate> = (0..30)
            .map(|i| candidate(&format!("https://instagram.com/u{i}"), Platform::Instagram))
            .collect();
        let cached: HashMap<String, Value> = candidates
            .iter()
            .take(10)
            .map(|c| (c.profile_url.clone(), cached_payload(&c.profile_url)))
            .collect();

        let plan = build_plan(&candidates, &cached);
        for batch in &plan {
            if let BatchSource::Fetch(urls) = &batch.source {
                assert!(urls.iter().all(|u| !cached.contains_key(u)));
            }
        }
    }

    #[test]
    fn merge_sorts_by_fit_descending_deterministically() {
        let batches = vec![
            (0, json!([{"fit_score": 70, "profile_url": "a"}, {"fit_score": 100, "profile_url": "b"}])),
            (1, json!([{"fit_score": 70, "profile_url": "c"}, {"fit_score": 20, "profile_url": "d"}])),
        ];
        let merged = merge_scored_batches(batches);

        let fits: Vec<i64> = merged.iter().map(|p| p["fit_score"].as_i64().unwrap()).collect();
        assert_eq!(fits, vec![100, 70, 70, 20]);
        // Stable sort: batch 0's 70 precedes batch 1's 70
        assert_eq!(merged[1]["profile_url"], "a");
        assert_eq!(merged[2]["profile_url"], "c");
    }

    #[test]
    fn batch_progress_spans_fifty_to_ninety_five() {
        assert_eq!(batch_progress(0, 10), 50);
        assert_eq!(batch_progress(5, 10), 73);
        assert_eq!(batch_progress(10, 10), 95);
        assert_eq!(batch_progress(0, 0), 95);
    }
}
