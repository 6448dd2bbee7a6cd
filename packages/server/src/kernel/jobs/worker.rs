//! Pipeline worker: claims jobs from the queue and runs the engine.
//!
//! The worker is a long-running service that:
//! - Polls the job table for runnable jobs (claim with SKIP LOCKED)
//! - Runs the pipeline engine on each claimed job
//! - Heartbeats the lease while a job executes
//! - Reports infrastructure failures back to the queue for redelivery
//!
//! Multiple worker processes can poll the same table; the claim query's row
//! locking guarantees one executor per job at a time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::queue::PipelineQueue;
use crate::domains::pipeline::PipelineEngine;
use crate::kernel::ServerKernel;

/// Configuration for the pipeline worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of jobs executing concurrently on this worker
    pub concurrency: usize,
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
    /// How often to extend leases of running jobs
    pub heartbeat_interval: Duration,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

pub struct PipelineWorker {
    kernel: Arc<ServerKernel>,
    queue: Arc<PipelineQueue>,
    config: WorkerConfig,
}

impl PipelineWorker {
    pub fn new(kernel: Arc<ServerKernel>, queue: Arc<PipelineQueue>, config: WorkerConfig) -> Self {
        Self {
            kernel,
            queue,
            config,
        }
    }

    /// Run until the shutdown token fires. In-flight jobs get a grace period
    /// and are otherwise recovered by lease expiry on another worker.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "pipeline worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let jobs = match self
                .queue
                .claim(&self.config.worker_id, self.config.concurrency as i64)
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "failed to claim jobs");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = jobs.len(), "claimed jobs");

            let mut handles = Vec::with_capacity(jobs.len());
            for job in jobs {
                handles.push(self.process_job(job));
            }
            futures::future::join_all(handles).await;
        }

        info!(worker_id = %self.config.worker_id, "pipeline worker stopped");
        Ok(())
    }

    /// Execute one claimed job with a lease heartbeat alongside it.
    async fn process_job(&self, job: crate::kernel::jobs::PipelineJob) {
        let job_id = job.job_id;
        let heartbeat_cancel = CancellationToken::new();

        let queue = self.queue.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_token = heartbeat_cancel.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // skip the immediate first tick

            loop {
                tokio::select! {
                    _ = heartbeat_token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = queue.heartbeat(job_id).await {
                            warn!(job_id = %job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });

        let engine = PipelineEngine::new(self.kernel.clone());
        let result = engine.execute(job).await;

        heartbeat_cancel.cancel();
        let _ = heartbeat_handle.await;

        match result {
            Ok(()) => {
                debug!(job_id = %job_id, "job run finished");
                if let Err(e) = self.queue.mark_succeeded(job_id).await {
                    error!(job_id = %job_id, error = %e, "failed to release job");
                }
            }
            Err(e) => {
                warn!(job_id = %job_id, error = ?e, "job run failed");
                if let Err(e) = self.queue.mark_failed(job_id, &format!("{e:#}")).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job failed");
                }
            }
        }
    }
}
