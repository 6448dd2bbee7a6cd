//! Capability interfaces for the four external collaborators.
//!
//! The engine only ever sees these traits; production implementations wrap
//! the provider client packages, and tests substitute deterministic
//! fixture-backed ones.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use brightdata::{BrightDataClient, TriggerEntry};
use openai_client::{ChatRequest, Message, OpenAIClient};
use weaviate::WeaviateClient;

use crate::common::Platform;

pub use brightdata::SnapshotStatus;
pub use weaviate::{HybridQuery, SearchHit, TargetWeights};

// =============================================================================
// Traits
// =============================================================================

/// Dense-vector embedding of keyword texts, one batched call.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Hybrid search against the external vector index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Readiness probe, checked once at startup and exposed via /health.
    async fn ready(&self) -> bool;

    async fn hybrid_search(&self, query: &HybridQuery) -> Result<Vec<SearchHit>>;
}

/// Asynchronous profile enrichment: trigger a batch, poll it, download it.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    async fn trigger(&self, urls: &[String], platform: Platform) -> Result<String>;

    async fn progress(&self, snapshot_id: &str) -> Result<SnapshotStatus>;

    async fn download(&self, snapshot_id: &str) -> Result<Vec<Value>>;
}

/// The scoring model: strict-JSON chat completions.
#[async_trait]
pub trait ScoringModel: Send + Sync {
    async fn complete_json(&self, system: &str, user: &str) -> Result<String>;
}

// =============================================================================
// Production implementations
// =============================================================================

/// Embeddings over an OpenAI-compatible endpoint.
pub struct OpenAiEmbeddings {
    client: OpenAIClient,
    model: String,
}

impl OpenAiEmbeddings {
    pub fn new(client: OpenAIClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.client
            .create_embeddings(texts, &self.model)
            .await
            .context("embedding call failed")
    }
}

/// Primary/secondary embedding chain. On a payment-required or any other
/// failure of the first provider, the second one (when configured) gets the
/// same batch.
pub struct FallbackEmbeddings {
    first: OpenAiEmbeddings,
    second: Option<OpenAiEmbeddings>,
}

impl FallbackEmbeddings {
    pub fn new(first: OpenAiEmbeddings, second: Option<OpenAiEmbeddings>) -> Self {
        Self { first, second }
    }
}

#[async_trait]
impl EmbeddingProvider for FallbackEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self.first.embed_batch(texts).await {
            Ok(vectors) => Ok(vectors),
            Err(e) => match &self.second {
                Some(second) => {
                    tracing::warn!(error = %e, "primary embeddings failed, falling back");
                    second
                        .embed_batch(texts)
                        .await
                        .context("secondary embedding provider failed")
                }
                None => Err(e),
            },
        }
    }
}

/// The external vector index.
pub struct WeaviateIndex {
    client: WeaviateClient,
}

impl WeaviateIndex {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        collection: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client: WeaviateClient::new(base_url, api_key, collection).with_timeout(timeout),
        }
    }
}

#[async_trait]
impl VectorIndex for WeaviateIndex {
    async fn ready(&self) -> bool {
        self.client.ready().await
    }

    async fn hybrid_search(&self, query: &HybridQuery) -> Result<Vec<SearchHit>> {
        self.client
            .hybrid_search(query)
            .await
            .context("vector index search failed")
    }
}

/// Bright Data datasets, one dataset id per platform.
pub struct BrightDataEnrichment {
    client: BrightDataClient,
    dataset_instagram: String,
    dataset_tiktok: String,
}

impl BrightDataEnrichment {
    pub fn new(
        client: BrightDataClient,
        dataset_instagram: impl Into<String>,
        dataset_tiktok: impl Into<String>,
    ) -> Self {
        Self {
            client,
            dataset_instagram: dataset_instagram.into(),
            dataset_tiktok: dataset_tiktok.into(),
        }
    }
}

#[async_trait]
impl EnrichmentProvider for BrightDataEnrichment {
    async fn trigger(&self, urls: &[String], platform: Platform) -> Result<String> {
        let (dataset_id, entries): (&str, Vec<TriggerEntry>) = match platform {
            Platform::Instagram => (
                &self.dataset_instagram,
                urls.iter().map(|u| TriggerEntry::instagram(u.as_str())).collect(),
            ),
            Platform::Tiktok => (
                &self.dataset_tiktok,
                urls.iter().map(|u| TriggerEntry::tiktok(u.as_str())).collect(),
            ),
            Platform::Unknown => {
                return Err(anyhow!("no enrichment dataset for unknown platform"));
            }
        };

        self.client
            .trigger(dataset_id, &entries)
            .await
            .context("enrichment trigger failed")
    }

    async fn progress(&self, snapshot_id: &str) -> Result<SnapshotStatus> {
        self.client
            .progress(snapshot_id)
            .await
            .context("enrichment progress check failed")
    }

    async fn download(&self, snapshot_id: &str) -> Result<Vec<Value>> {
        self.client
            .download(snapshot_id)
            .await
            .context("enrichment download failed")
    }
}

/// Scoring via an OpenAI-compatible chat model in strict-JSON mode.
pub struct OpenAiScoringModel {
    client: OpenAIClient,
    model: String,
}

impl OpenAiScoringModel {
    pub fn new(client: OpenAIClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ScoringModel for OpenAiScoringModel {
    async fn complete_json(&self, system: &str, user: &str) -> Result<String> {
        let request = ChatRequest::new(&self.model)
            .message(Message::system(system))
            .message(Message::user(user))
            .temperature(0.0)
            .json_mode();

        let response = self
            .client
            .chat_completion(request)
            .await
            .context("scoring model call failed")?;
        Ok(response.content)
    }
}
