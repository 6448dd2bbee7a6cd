//! Durable job queue: the job model, claim/retry operations, and the worker.

pub mod job;
pub mod queue;
pub mod worker;

pub use job::{JobStatus, PipelineJob, PipelineStage, DEFAULT_LEASE_SECS};
pub use queue::PipelineQueue;
pub use worker::{PipelineWorker, WorkerConfig};
