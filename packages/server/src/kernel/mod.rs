//! Core infrastructure: configuration, the shared kernel, the durable-store
//! access layer, and provider capability interfaces.

pub mod api_keys;
pub mod artifacts;
pub mod cleanup;
pub mod config;
pub mod events;
pub mod external_calls;
pub mod idempotency;
pub mod jobs;
pub mod profile_cache;
pub mod providers;
pub mod rate_limit;
pub mod server_kernel;

pub use api_keys::ApiKey;
pub use artifacts::{ArtifactKind, JobArtifact};
pub use config::Config;
pub use events::{EventLevel, JobEvent};
pub use external_calls::{ExternalCall, ServiceUsage};
pub use idempotency::IdempotencyKey;
pub use profile_cache::CachedProfile;
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use server_kernel::ServerKernel;
