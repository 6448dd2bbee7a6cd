//! Shared per-run state and the stage-level error type.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::params::SearchParams;
use super::timing::Waterfall;
use crate::kernel::events::{EventLevel, JobEvent};
use crate::kernel::jobs::{PipelineJob, PipelineStage};
use crate::kernel::ServerKernel;

/// How a stage ends early.
///
/// `Cancelled` is a clean terminal, `Fatal` turns the job into a terminal
/// `error`, and `Infra` bubbles to the worker so queue redelivery can retry
/// the run.
#[derive(Debug)]
pub enum StageError {
    Cancelled,
    Fatal {
        stage: &'static str,
        message: String,
    },
    Infra(anyhow::Error),
}

impl From<anyhow::Error> for StageError {
    fn from(e: anyhow::Error) -> Self {
        StageError::Infra(e)
    }
}

pub type StageResult<T> = Result<T, StageError>;

/// Fatal-error helper for provider failures inside a stage.
pub fn fatal(stage: &'static str, error: impl std::fmt::Display) -> StageError {
    StageError::Fatal {
        stage,
        message: error.to_string(),
    }
}

/// Per-run counters surfaced in job meta and `pipeline_stats`.
#[derive(Debug, Default, Clone)]
pub struct RunCounters {
    pub candidates_found: u32,
    pub total_batches: u32,
    pub batches_completed: u32,
    pub batches_failed: u32,
    pub cache_hits: u32,
    pub api_calls: u32,
    pub profiles_analyzed: u32,
    pub good_found: u32,
}

/// Everything a stage needs: the kernel, the job identity, validated params,
/// the waterfall, and shared counters.
pub struct RunContext {
    pub kernel: Arc<ServerKernel>,
    pub job_id: Uuid,
    pub api_key_id: Uuid,
    pub params: SearchParams,
    started: std::time::Instant,
    waterfall: Mutex<Waterfall>,
    counters: Mutex<RunCounters>,
}

/// Cancellation-responsive sleeps yield in slices no longer than this.
const SLEEP_SLICE: Duration = Duration::from_millis(500);

impl RunContext {
    pub fn new(kernel: Arc<ServerKernel>, job: &PipelineJob, params: SearchParams) -> Self {
        Self {
            kernel,
            job_id: job.job_id,
            api_key_id: job.api_key_id,
            params,
            started: std::time::Instant::now(),
            waterfall: Mutex::new(Waterfall::new()),
            counters: Mutex::new(RunCounters::default()),
        }
    }

    /// Milliseconds since this run started on the worker.
    pub fn elapsed_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    pub fn db(&self) -> &PgPool {
        &self.kernel.db
    }

    /// Observe the soft cancellation signal. Checked before every outbound
    /// call, before each batch, and around every sleep.
    pub async fn check_cancelled(&self) -> StageResult<()> {
        let signalled = PipelineJob::cancel_signalled(self.job_id, self.db())
            .await
            .map_err(StageError::Infra)?;
        if signalled {
            return Err(StageError::Cancelled);
        }
        Ok(())
    }

    /// Sleep in ≤500ms slices, re-checking cancellation between slices.
    pub async fn sleep_cancellable(&self, total: Duration) -> StageResult<()> {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            let slice = remaining.min(SLEEP_SLICE);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
            self.check_cancelled().await?;
        }
        Ok(())
    }

    /// Append an event to the job's log.
    pub async fn event(&self, level: EventLevel, event_type: &str, data: Value) -> StageResult<()> {
        JobEvent::append(self.job_id, level, event_type, data, self.db())
            .await
            .map_err(StageError::Infra)?;
        Ok(())
    }

    /// Advance stage and monotone progress on the job row.
    pub async fn advance(&self, stage: PipelineStage, progress: i32) -> StageResult<()> {
        PipelineJob::advance(self.job_id, stage, progress, self.db())
            .await
            .map_err(StageError::Infra)
    }

    /// Merge counters or stage markers into the job meta map.
    pub async fn merge_meta(&self, patch: Value) -> StageResult<()> {
        PipelineJob::merge_meta(self.job_id, &patch, self.db())
            .await
            .map_err(StageError::Infra)
    }

    pub fn counters(&self) -> MutexGuard<'_, RunCounters> {
        self.counters.lock().expect("counters mutex poisoned")
    }

    pub fn wf_start(&self, name: &str) {
        self.waterfall.lock().expect("waterfall mutex poisoned").start(name);
    }

    pub fn wf_end(&self, name: &str) {
        self.waterfall.lock().expect("waterfall mutex poisoned").end(name);
    }

    pub fn waterfall_value(&self) -> Value {
        self.waterfall
            .lock()
            .expect("waterfall mutex poisoned")
            .to_value()
    }
}
