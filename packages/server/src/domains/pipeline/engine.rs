//! The pipeline engine: the four-stage state machine.
//!
//! ```text
//! pending ──▶ running ──▶ completed
//!               │
//!               ├─▶ error        (fatal stage failure)
//!               └─▶ cancelled    (cancel_requested observed at any await)
//! ```
//!
//! The engine owns every job mutation after admission. Stage errors map to
//! terminal transitions here; infrastructure errors bubble to the worker so
//! queue redelivery can retry the run (stage entry points re-read state, so
//! a redelivered terminal job is a no-op).

use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};

use super::context::{RunContext, StageError, StageResult};
use super::params::SearchParams;
use super::stages::enrichment::merge_scored_batches;
use super::stages::{enrichment, query_expansion, vector_search};
use crate::kernel::artifacts::{ArtifactKind, JobArtifact};
use crate::kernel::events::{EventLevel, JobEvent};
use crate::kernel::external_calls::ExternalCall;
use crate::kernel::jobs::{PipelineJob, PipelineStage};
use crate::kernel::ServerKernel;

/// Estimated cost per enriched profile returned by the provider.
pub const ENRICHMENT_COST_PER_PROFILE: f64 = 0.0015;

/// Estimated cost per profile scored by the model.
pub const SCORING_COST_PER_PROFILE: f64 = 0.0015;

pub struct PipelineEngine {
    kernel: Arc<ServerKernel>,
}

impl PipelineEngine {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self { kernel }
    }

    /// Run one claimed job to a terminal state.
    ///
    /// Returns `Err` only for infrastructure failures the queue should
    /// redeliver; every pipeline outcome (completed, cancelled, error) is
    /// written here and reported as `Ok`.
    pub async fn execute(&self, claimed: PipelineJob) -> Result<()> {
        let db = &self.kernel.db;

        // Redelivery safety: re-read the row, skip finished work
        let Some(job) = PipelineJob::find_by_id(claimed.job_id, db).await? else {
            tracing::warn!(job_id = %claimed.job_id, "claimed job vanished");
            return Ok(());
        };
        if job.status.is_terminal() {
            tracing::debug!(job_id = %job.job_id, status = ?job.status, "job already terminal");
            return Ok(());
        }

        let params: SearchParams = match serde_json::from_value(job.params.clone()) {
            Ok(params) => params,
            Err(e) => {
                // Bad params can never succeed; fail terminally instead of
                // burning redelivery attempts
                let error = json!({"kind": "fatal", "message": format!("invalid job params: {e}")});
                PipelineJob::finish_error(job.job_id, &error, db).await?;
                JobEvent::append(
                    job.job_id,
                    EventLevel::Error,
                    "pipeline_summary",
                    json!({"status": "error", "message": error["message"]}),
                    db,
                )
                .await?;
                return Ok(());
            }
        };

        let ctx = RunContext::new(self.kernel.clone(), &job, params);
        tracing::info!(job_id = %ctx.job_id, attempt = job.attempts, "pipeline run starting");

        match self.run_pipeline(&ctx).await {
            Ok(()) => Ok(()),
            Err(StageError::Cancelled) => self.finish_cancelled(&ctx).await,
            Err(StageError::Fatal { stage, message }) => {
                self.finish_error(&ctx, stage, &message).await
            }
            Err(StageError::Infra(e)) => Err(e),
        }
    }

    async fn run_pipeline(&self, ctx: &RunContext) -> StageResult<()> {
        ctx.check_cancelled().await?;
        ctx.event(
            EventLevel::Info,
            "pipeline_started",
            json!({
                "top_n": ctx.params.top_n,
                "weaviate_top_n": ctx.params.weaviate_top_n,
                "llm_top_n": ctx.params.llm_top_n,
                "platform": ctx.params.platform,
                "strict_location_matching": ctx.params.strict_location_matching,
            }),
        )
        .await?;

        let keywords = query_expansion::run(ctx).await?;
        let candidates = vector_search::run(ctx, &keywords).await?;
        enrichment::run(ctx, &candidates).await?;
        self.finalize(ctx).await
    }

    /// Merge the surviving batches into `final`/`remaining`, close out
    /// `progressive`, publish timing and stats, and complete the job.
    async fn finalize(&self, ctx: &RunContext) -> StageResult<()> {
        ctx.check_cancelled().await?;
        ctx.advance(PipelineStage::Scoring, 95).await?;
        ctx.wf_start("finalize");

        let batches = JobArtifact::list_batches(ctx.job_id, ctx.db())
            .await
            .map_err(StageError::Infra)?;
        let merged = merge_scored_batches(batches);

        let llm_top_n = ctx.params.llm_top_n as usize;
        let top: Vec<Value> = merged.iter().take(llm_top_n).cloned().collect();
        let remaining: Vec<Value> = merged.iter().skip(llm_top_n).cloned().collect();

        let counters = ctx.counters().clone();
        let stats = pipeline_stats(&counters);
        let result_count = top.len();

        JobArtifact::upsert(
            ctx.job_id,
            ArtifactKind::Final,
            &json!({"profiles": top.clone(), "pipeline_stats": stats.clone()}),
            ctx.db(),
        )
        .await
        .map_err(StageError::Infra)?;
        JobArtifact::upsert(
            ctx.job_id,
            ArtifactKind::Remaining,
            &json!({"profiles": remaining}),
            ctx.db(),
        )
        .await
        .map_err(StageError::Infra)?;
        JobArtifact::upsert(
            ctx.job_id,
            ArtifactKind::Progressive,
            &json!({"profiles": top, "is_complete": true}),
            ctx.db(),
        )
        .await
        .map_err(StageError::Infra)?;

        ctx.merge_meta(json!({"scoring_status": "completed"})).await?;
        ctx.wf_end("finalize");
        JobArtifact::upsert(
            ctx.job_id,
            ArtifactKind::Timing,
            &ctx.waterfall_value(),
            ctx.db(),
        )
        .await
        .map_err(StageError::Infra)?;

        self.record_ledger(ctx, &counters).await?;

        PipelineJob::finish_completed(ctx.job_id, ctx.db())
            .await
            .map_err(StageError::Infra)?;
        ctx.event(
            EventLevel::Info,
            "pipeline_summary",
            json!({"status": "completed", "pipeline_stats": stats}),
        )
        .await?;
        tracing::info!(job_id = %ctx.job_id, results = result_count, "pipeline completed");

        Ok(())
    }

    /// Two ledger rows per run: enrichment and scoring, with cost estimates.
    async fn record_ledger(
        &self,
        ctx: &RunContext,
        counters: &super::context::RunCounters,
    ) -> StageResult<()> {
        let duration_ms = ctx.elapsed_ms();

        ExternalCall::record(
            ctx.job_id,
            ctx.api_key_id,
            "enrichment",
            "snapshot_fan_out",
            duration_ms,
            "completed",
            counters.api_calls as f64 * ENRICHMENT_COST_PER_PROFILE,
            json!({
                "api_calls": counters.api_calls,
                "cache_hits": counters.cache_hits,
                "batches_completed": counters.batches_completed,
                "batches_failed": counters.batches_failed,
            }),
            ctx.db(),
        )
        .await
        .map_err(StageError::Infra)?;

        ExternalCall::record(
            ctx.job_id,
            ctx.api_key_id,
            "scoring",
            "batch_scoring",
            duration_ms,
            "completed",
            counters.profiles_analyzed as f64 * SCORING_COST_PER_PROFILE,
            json!({"profiles_analyzed": counters.profiles_analyzed}),
            ctx.db(),
        )
        .await
        .map_err(StageError::Infra)?;

        Ok(())
    }

    /// Cancellation observed at an await point: clean terminal, summary once.
    async fn finish_cancelled(&self, ctx: &RunContext) -> Result<()> {
        JobArtifact::upsert(
            ctx.job_id,
            ArtifactKind::Timing,
            &ctx.waterfall_value(),
            ctx.db(),
        )
        .await?;
        PipelineJob::finish_cancelled(ctx.job_id, ctx.db()).await?;
        JobEvent::append(
            ctx.job_id,
            EventLevel::Info,
            "pipeline_summary",
            json!({"status": "cancelled"}),
            ctx.db(),
        )
        .await?;
        tracing::info!(job_id = %ctx.job_id, "pipeline cancelled");
        Ok(())
    }

    /// Fatal stage failure: stage-scoped error in meta, terminal `error`.
    async fn finish_error(&self, ctx: &RunContext, stage: &'static str, message: &str) -> Result<()> {
        let mut stage_meta = serde_json::Map::new();
        stage_meta.insert(format!("{stage}_status"), json!("error"));
        stage_meta.insert(format!("{stage}_error"), json!(message));
        PipelineJob::merge_meta(ctx.job_id, &Value::Object(stage_meta), ctx.db()).await?;
        JobArtifact::upsert(
            ctx.job_id,
            ArtifactKind::Timing,
            &ctx.waterfall_value(),
            ctx.db(),
        )
        .await?;

        let error = json!({"kind": "fatal", "stage": stage, "message": message});
        PipelineJob::finish_error(ctx.job_id, &error, ctx.db()).await?;
        JobEvent::append(
            ctx.job_id,
            EventLevel::Error,
            "pipeline_summary",
            json!({"status": "error", "stage": stage, "message": message}),
            ctx.db(),
        )
        .await?;
        tracing::error!(job_id = %ctx.job_id, stage, message, "pipeline failed");
        Ok(())
    }
}

/// Run statistics published on the `final` artifact and summary event.
pub fn pipeline_stats(counters: &super::context::RunCounters) -> Value {
    let enrichment_cost = counters.api_calls as f64 * ENRICHMENT_COST_PER_PROFILE;
    let scoring_cost = counters.profiles_analyzed as f64 * SCORING_COST_PER_PROFILE;

    json!({
        "candidates_found": counters.candidates_found,
        "total_batches": counters.total_batches,
        "batches_completed": counters.batches_completed,
        "batches_failed": counters.batches_failed,
        "cache_hits": counters.cache_hits,
        "api_calls": counters.api_calls,
        "profiles_analyzed": counters.profiles_analyzed,
        "good_found": counters.good_found,
        "cost_estimates": {
            "enrichment_usd": enrichment_cost,
            "scoring_usd": scoring_cost,
            "total_usd": enrichment_cost + scoring_cost,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::pipeline::context::RunCounters;

    #[test]
    fn stats_cost_estimates_multiply_per_profile_rates() {
        let counters = RunCounters {
            candidates_found: 40,
            total_batches: 2,
            batches_completed: 2,
            batches_failed: 0,
            cache_hits: 20,
            api_calls: 20,
            profiles_analyzed: 40,
            good_found: 5,
        };
        let stats = pipeline_stats(&counters);

        assert_eq!(stats["api_calls"], 20);
        let enrichment = stats["cost_estimates"]["enrichment_usd"].as_f64().unwrap();
        let scoring = stats["cost_estimates"]["scoring_usd"].as_f64().unwrap();
        let total = stats["cost_estimates"]["total_usd"].as_f64().unwrap();
        assert!((enrichment - 0.03).abs() < 1e-9);
        assert!((scoring - 0.06).abs() < 1e-9);
        assert!((total - 0.09).abs() < 1e-9);
    }

    #[test]
    fn cached_only_run_reports_zero_api_calls() {
        let counters = RunCounters {
            cache_hits: 20,
            api_calls: 0,
            profiles_analyzed: 20,
            ..Default::default()
        };
        let stats = pipeline_stats(&counters);
        assert_eq!(stats["api_calls"], 0);
        assert_eq!(stats["cost_estimates"]["enrichment_usd"], 0.0);
    }
}
