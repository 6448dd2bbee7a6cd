//! End-to-end engine runs against fixture providers and a real Postgres.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use common::*;
use server_core::common::hash::cache_key;
use server_core::domains::pipeline::{PipelineEngine, SearchParams, SearchRequest};
use server_core::kernel::artifacts::{ArtifactKind, JobArtifact};
use server_core::kernel::events::JobEvent;
use server_core::kernel::jobs::{JobStatus, PipelineJob};
use server_core::kernel::{CachedProfile, ServerKernel};

fn params(description: &str, top_n: u32) -> SearchParams {
    SearchRequest {
        business_description: description.into(),
        top_n: Some(top_n),
        weaviate_top_n: None,
        llm_top_n: None,
        min_followers: None,
        max_followers: None,
        platform: None,
        exclude_profile_urls: Vec::new(),
        strict_location_matching: false,
    }
    .validate()
    .expect("valid test params")
}

async fn insert_job(pool: &PgPool, api_key_id: Uuid, params: &SearchParams) -> PipelineJob {
    PipelineJob::builder()
        .api_key_id(api_key_id)
        .params(serde_json::to_value(params).unwrap())
        .build()
        .insert(pool)
        .await
        .expect("insert job")
}

/// Claim exactly this job, scoped to its id so concurrent tests on the
/// shared database never steal each other's work.
async fn claim_job(pool: &PgPool, job_id: Uuid) -> PipelineJob {
    sqlx::query_as::<_, PipelineJob>(
        r#"
        UPDATE pipeline_jobs
        SET status = 'running', attempts = attempts + 1, worker_id = 'test-worker',
            lease_expires_at = NOW() + INTERVAL '120 seconds',
            started_at = COALESCE(started_at, NOW())
        WHERE job_id = $1
        RETURNING job_id, api_key_id, status, params, meta, progress, current_stage, error,
                  cancel_requested, attempts, max_attempts, next_attempt_at, lease_expires_at,
                  worker_id, created_at, started_at, finished_at
        "#,
    )
    .bind(job_id)
    .fetch_one(pool)
    .await
    .expect("claim job")
}

async fn run_engine(kernel: &Arc<ServerKernel>, job: PipelineJob) {
    PipelineEngine::new(kernel.clone())
        .execute(job)
        .await
        .expect("engine run should not hit infrastructure errors");
}

async fn final_artifact(pool: &PgPool, job_id: Uuid) -> Value {
    JobArtifact::get(job_id, ArtifactKind::Final, pool)
        .await
        .unwrap()
        .expect("final artifact present")
        .data
}

#[tokio::test]
async fn cached_happy_path_completes_without_enrichment_calls() {
    let urls = profile_urls(20);
    let hits = urls
        .iter()
        .enumerate()
        .map(|(i, url)| search_hit(url, 0.9 - i as f64 * 0.01))
        .collect();
    let enrichment = Arc::new(FixtureEnrichment::new(Vec::new()));
    let kernel = test_kernel(
        Arc::new(FixtureEmbeddings),
        Arc::new(FixtureIndex::new(hits)),
        enrichment.clone(),
        Arc::new(FixtureScoring),
    )
    .await;
    let pool = kernel.db.clone();
    let (api_key, _) = create_api_key(&pool, "cached-path", 10.0, 10.0, false)
        .await
        .unwrap();
    seed_cache(&pool, &urls, true).await.unwrap();

    let job = insert_job(&pool, api_key.id, &params("austin coffee lifestyle creators", 5)).await;
    let claimed = claim_job(&pool, job.job_id).await;
    run_engine(&kernel, claimed).await;

    let job = PipelineJob::find_by_id(job.job_id, &pool).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert!(job.finished_at.is_some());

    let final_data = final_artifact(&pool, job.job_id).await;
    let profiles = final_data["profiles"].as_array().unwrap();
    assert_eq!(profiles.len(), 5);
    let fits: Vec<i64> = profiles
        .iter()
        .map(|p| p["fit_score"].as_i64().unwrap())
        .collect();
    assert!(fits.windows(2).all(|w| w[0] >= w[1]), "sorted by fit desc");
    assert!(fits.iter().all(|&f| f == 100));

    let stats = &final_data["pipeline_stats"];
    assert_eq!(stats["api_calls"], 0, "cache-only run never dials the provider");
    assert_eq!(stats["cache_hits"], 20);
    assert_eq!(enrichment.trigger_count(), 0);

    let progressive = JobArtifact::get(job.job_id, ArtifactKind::Progressive, &pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progressive.data["is_complete"], true);

    let events = JobEvent::list_after(job.job_id, 0, 1000, &pool).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "pipeline_summary"));
    let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "event ids strictly ascend");
}

#[tokio::test]
async fn fetch_path_enriches_uncached_candidates_and_writes_back() {
    let urls = profile_urls(10);
    let hits = urls.iter().map(|url| search_hit(url, 0.8)).collect();
    let raw: Vec<Value> = urls.iter().map(|url| raw_profile(url, false)).collect();
    let enrichment = Arc::new(FixtureEnrichment::new(raw));
    let kernel = test_kernel(
        Arc::new(FixtureEmbeddings),
        Arc::new(FixtureIndex::new(hits)),
        enrichment.clone(),
        Arc::new(FixtureScoring),
    )
    .await;
    let pool = kernel.db.clone();
    let (api_key, _) = create_api_key(&pool, "fetch-path", 10.0, 10.0, false)
        .await
        .unwrap();

    let job = insert_job(&pool, api_key.id, &params("nyc streetwear men", 5)).await;
    let claimed = claim_job(&pool, job.job_id).await;
    run_engine(&kernel, claimed).await;

    let job = PipelineJob::find_by_id(job.job_id, &pool).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let final_data = final_artifact(&pool, job.job_id).await;
    assert_eq!(final_data["profiles"].as_array().unwrap().len(), 5);
    assert_eq!(final_data["pipeline_stats"]["api_calls"], 10);
    assert_eq!(enrichment.trigger_count(), 1, "10 urls fit one batch");

    // remaining carries everything past the top llm_top_n
    let remaining = JobArtifact::get(job.job_id, ArtifactKind::Remaining, &pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remaining.data["profiles"].as_array().unwrap().len(), 5);

    // Cache write-back is fire-and-forget; give it a moment
    let keys: Vec<String> = urls
        .iter()
        .map(|u| cache_key(&server_core::common::normalize_profile_url(u)))
        .collect();
    let mut cached = Vec::new();
    for _ in 0..50 {
        cached = CachedProfile::bulk_get(&keys, &pool).await.unwrap();
        if cached.len() == urls.len() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(cached.len(), urls.len(), "fetched profiles land in the cache");
}

#[tokio::test]
async fn adaptive_stop_stops_triggering_once_target_is_met() {
    // 140 uncached candidates → 7 planned batches, in-flight cap 5. The
    // first processed batch yields 20 perfect fits ≥ target 5, so the two
    // never-triggered batches must stay untriggered.
    let urls = profile_urls(140);
    let hits = urls
        .iter()
        .enumerate()
        .map(|(i, url)| search_hit(url, 1.0 - i as f64 * 0.001))
        .collect();
    let raw: Vec<Value> = urls.iter().map(|url| raw_profile(url, true)).collect();
    let enrichment = Arc::new(FixtureEnrichment::new(raw));
    let kernel = test_kernel(
        Arc::new(FixtureEmbeddings),
        Arc::new(FixtureIndex::new(hits)),
        enrichment.clone(),
        Arc::new(FixtureScoring),
    )
    .await;
    let pool = kernel.db.clone();
    let (api_key, _) = create_api_key(&pool, "adaptive-stop", 10.0, 10.0, false)
        .await
        .unwrap();

    let job = insert_job(&pool, api_key.id, &params("austin coffee", 5)).await;
    let claimed = claim_job(&pool, job.job_id).await;
    run_engine(&kernel, claimed).await;

    let job = PipelineJob::find_by_id(job.job_id, &pool).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(
        enrichment.trigger_count() <= 5,
        "no further triggers after the good-fit target: {} issued",
        enrichment.trigger_count()
    );

    let events = JobEvent::list_after(job.job_id, 0, 1000, &pool).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "adaptive_stop"));
}

#[tokio::test]
async fn all_failed_batches_fail_the_run() {
    let urls = profile_urls(10);
    let hits = urls.iter().map(|url| search_hit(url, 0.8)).collect();
    let enrichment = Arc::new(FixtureEnrichment::new(Vec::new()));
    enrichment.fail_triggers.store(true, Ordering::SeqCst);
    let kernel = test_kernel(
        Arc::new(FixtureEmbeddings),
        Arc::new(FixtureIndex::new(hits)),
        enrichment.clone(),
        Arc::new(FixtureScoring),
    )
    .await;
    let pool = kernel.db.clone();
    let (api_key, _) = create_api_key(&pool, "all-fail", 10.0, 10.0, false)
        .await
        .unwrap();

    let job = insert_job(&pool, api_key.id, &params("austin coffee", 5)).await;
    let claimed = claim_job(&pool, job.job_id).await;
    run_engine(&kernel, claimed).await;

    let job = PipelineJob::find_by_id(job.job_id, &pool).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.progress, 100);
    let error = job.error.expect("error recorded");
    assert_eq!(error["kind"], "fatal");
}

#[tokio::test]
async fn failed_triggers_are_tolerated_when_cache_batches_succeed() {
    let cached_urls = profile_urls(20);
    let uncached_urls: Vec<String> = (100..110)
        .map(|i| format!("https://instagram.com/creator{i}"))
        .collect();
    let mut hits: Vec<_> = cached_urls.iter().map(|u| search_hit(u, 0.9)).collect();
    hits.extend(uncached_urls.iter().map(|u| search_hit(u, 0.5)));

    let enrichment = Arc::new(FixtureEnrichment::new(Vec::new()));
    enrichment.fail_triggers.store(true, Ordering::SeqCst);
    let kernel = test_kernel(
        Arc::new(FixtureEmbeddings),
        Arc::new(FixtureIndex::new(hits)),
        enrichment.clone(),
        Arc::new(FixtureScoring),
    )
    .await;
    let pool = kernel.db.clone();
    let (api_key, _) = create_api_key(&pool, "partial-fail", 10.0, 10.0, false)
        .await
        .unwrap();
    // Non-perfect cache profiles so the fetch phase is actually attempted
    seed_cache(&pool, &cached_urls, false).await.unwrap();

    let job = insert_job(&pool, api_key.id, &params("austin coffee", 5)).await;
    let claimed = claim_job(&pool, job.job_id).await;
    run_engine(&kernel, claimed).await;

    let job = PipelineJob::find_by_id(job.job_id, &pool).await.unwrap().unwrap();
    assert_eq!(
        job.status,
        JobStatus::Completed,
        "failed fetch batches don't sink a run with surviving cache batches"
    );
    assert!(job.meta["batches_failed"].as_i64().unwrap() >= 1);
}

#[tokio::test]
async fn zero_candidates_finalizes_as_completed_and_empty() {
    let enrichment = Arc::new(FixtureEnrichment::new(Vec::new()));
    let kernel = test_kernel(
        Arc::new(FixtureEmbeddings),
        Arc::new(FixtureIndex::empty()),
        enrichment.clone(),
        Arc::new(FixtureScoring),
    )
    .await;
    let pool = kernel.db.clone();
    let (api_key, _) = create_api_key(&pool, "zero-candidates", 10.0, 10.0, false)
        .await
        .unwrap();

    let job = insert_job(&pool, api_key.id, &params("extremely obscure niche", 5)).await;
    let claimed = claim_job(&pool, job.job_id).await;
    run_engine(&kernel, claimed).await;

    let job = PipelineJob::find_by_id(job.job_id, &pool).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let final_data = final_artifact(&pool, job.job_id).await;
    assert!(final_data["profiles"].as_array().unwrap().is_empty());
    assert_eq!(final_data["pipeline_stats"]["candidates_found"], 0);
    assert_eq!(enrichment.trigger_count(), 0);
}

#[tokio::test]
async fn cancel_before_start_terminates_cleanly() {
    let urls = profile_urls(5);
    let hits = urls.iter().map(|u| search_hit(u, 0.8)).collect();
    let enrichment = Arc::new(FixtureEnrichment::new(Vec::new()));
    let kernel = test_kernel(
        Arc::new(FixtureEmbeddings),
        Arc::new(FixtureIndex::new(hits)),
        enrichment,
        Arc::new(FixtureScoring),
    )
    .await;
    let pool = kernel.db.clone();
    let (api_key, _) = create_api_key(&pool, "cancel-early", 10.0, 10.0, false)
        .await
        .unwrap();

    let job = insert_job(&pool, api_key.id, &params("austin coffee", 5)).await;
    assert!(PipelineJob::request_cancel(job.job_id, &pool).await.unwrap());

    let claimed = claim_job(&pool, job.job_id).await;
    run_engine(&kernel, claimed).await;

    let job = PipelineJob::find_by_id(job.job_id, &pool).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.progress, 100);

    let events = JobEvent::list_after(job.job_id, 0, 1000, &pool).await.unwrap();
    let summary = events
        .iter()
        .find(|e| e.event_type == "pipeline_summary")
        .expect("summary emitted");
    assert_eq!(summary.data["status"], "cancelled");
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_enrichment_reaches_cancelled() {
    // Snapshots never become ready, so the engine sits in the poll loop
    // until it observes the cancellation signal.
    let urls = profile_urls(10);
    let hits = urls.iter().map(|u| search_hit(u, 0.8)).collect();
    let enrichment = Arc::new(FixtureEnrichment::new(Vec::new()));
    enrichment.never_ready.store(true, Ordering::SeqCst);
    let kernel = test_kernel(
        Arc::new(FixtureEmbeddings),
        Arc::new(FixtureIndex::new(hits)),
        enrichment,
        Arc::new(FixtureScoring),
    )
    .await;
    let pool = kernel.db.clone();
    let (api_key, _) = create_api_key(&pool, "cancel-mid", 10.0, 10.0, false)
        .await
        .unwrap();

    let job = insert_job(&pool, api_key.id, &params("austin coffee", 5)).await;
    let job_id = job.job_id;
    let claimed = claim_job(&pool, job_id).await;

    let engine_kernel = kernel.clone();
    let engine_task = tokio::spawn(async move {
        PipelineEngine::new(engine_kernel).execute(claimed).await
    });

    // Cancel once enrichment is demonstrably in flight
    let canceller_pool = pool.clone();
    let canceller = tokio::spawn(async move {
        loop {
            let events = JobEvent::list_after(job_id, 0, 1000, &canceller_pool)
                .await
                .unwrap();
            if events.iter().any(|e| e.event_type == "batch_triggered") {
                PipelineJob::request_cancel(job_id, &canceller_pool)
                    .await
                    .unwrap();
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    });

    engine_task.await.unwrap().expect("engine run ok");
    canceller.await.unwrap();

    let job = PipelineJob::find_by_id(job_id, &pool).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.progress, 100);
}

#[tokio::test]
async fn redelivered_terminal_job_is_a_noop() {
    let urls = profile_urls(5);
    let hits = urls.iter().map(|u| search_hit(u, 0.8)).collect();
    let enrichment = Arc::new(FixtureEnrichment::new(
        urls.iter().map(|u| raw_profile(u, false)).collect(),
    ));
    let kernel = test_kernel(
        Arc::new(FixtureEmbeddings),
        Arc::new(FixtureIndex::new(hits)),
        enrichment,
        Arc::new(FixtureScoring),
    )
    .await;
    let pool = kernel.db.clone();
    let (api_key, _) = create_api_key(&pool, "redelivery", 10.0, 10.0, false)
        .await
        .unwrap();

    let job = insert_job(&pool, api_key.id, &params("austin coffee", 3)).await;
    let claimed = claim_job(&pool, job.job_id).await;
    run_engine(&kernel, claimed.clone()).await;

    let events_before = JobEvent::list_after(job.job_id, 0, 10_000, &pool)
        .await
        .unwrap()
        .len();

    // Simulated redelivery of the same claimed payload
    run_engine(&kernel, claimed).await;

    let events_after = JobEvent::list_after(job.job_id, 0, 10_000, &pool)
        .await
        .unwrap()
        .len();
    assert_eq!(events_before, events_after, "terminal jobs are skipped");

    let job = PipelineJob::find_by_id(job.job_id, &pool).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}
