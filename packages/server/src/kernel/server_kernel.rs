// ServerKernel - core infrastructure with all dependencies
//
// The ServerKernel holds everything the admission service and the execution
// engine share: the database pool, the four external providers behind their
// capability traits, and the global scoring-concurrency semaphore. It is
// built once at startup and never mutated afterwards.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Semaphore;

use brightdata::BrightDataClient;
use openai_client::OpenAIClient;

use super::config::{Config, EmbeddingsProvider as EmbeddingsProviderChoice};
use super::providers::{
    BrightDataEnrichment, EmbeddingProvider, EnrichmentProvider, FallbackEmbeddings,
    OpenAiEmbeddings, OpenAiScoringModel, ScoringModel, VectorIndex, WeaviateIndex,
};

/// Global cap on concurrent scoring-model calls across all running jobs.
pub const SCORING_CONCURRENCY: usize = 100;

/// ServerKernel holds all server dependencies.
pub struct ServerKernel {
    pub db: PgPool,
    pub config: Config,
    pub embeddings: Arc<dyn EmbeddingProvider>,
    pub vector_index: Arc<dyn VectorIndex>,
    pub enrichment: Arc<dyn EnrichmentProvider>,
    pub scoring: Arc<dyn ScoringModel>,
    /// Shared bound for scoring fan-out; all jobs on this worker draw from it
    pub scoring_semaphore: Arc<Semaphore>,
}

impl ServerKernel {
    /// Build the kernel with production providers derived from config.
    pub fn new(db: PgPool, config: Config) -> Self {
        let openai = OpenAIClient::new(config.openai_api_key.clone());

        let primary = OpenAiEmbeddings::new(openai.clone(), config.embeddings_model.clone());
        let secondary = match (
            &config.secondary_embeddings_base_url,
            &config.secondary_embeddings_api_key,
        ) {
            (Some(base_url), Some(key)) => Some(OpenAiEmbeddings::new(
                OpenAIClient::new(key.clone()).with_base_url(base_url.clone()),
                config
                    .secondary_embeddings_model
                    .clone()
                    .unwrap_or_else(|| config.embeddings_model.clone()),
            )),
            _ => None,
        };
        let embeddings: Arc<dyn EmbeddingProvider> = match config.embeddings_provider {
            EmbeddingsProviderChoice::Primary => {
                Arc::new(FallbackEmbeddings::new(primary, secondary))
            }
            EmbeddingsProviderChoice::Secondary => match secondary {
                Some(secondary) => Arc::new(FallbackEmbeddings::new(secondary, Some(primary))),
                None => {
                    tracing::warn!(
                        "EMBEDDINGS_PROVIDER=secondary but no secondary endpoint configured; \
                         using primary"
                    );
                    Arc::new(FallbackEmbeddings::new(primary, None))
                }
            },
        };

        let vector_index: Arc<dyn VectorIndex> = Arc::new(WeaviateIndex::new(
            config.weaviate_url.clone(),
            config.weaviate_api_key.clone(),
            config.weaviate_collection.clone(),
            Duration::from_secs(config.weaviate_timeout_secs),
        ));

        let enrichment: Arc<dyn EnrichmentProvider> = Arc::new(BrightDataEnrichment::new(
            BrightDataClient::new(config.brightdata_api_key.clone()),
            config.brightdata_dataset_instagram.clone(),
            config.brightdata_dataset_tiktok.clone(),
        ));

        let scoring: Arc<dyn ScoringModel> = Arc::new(OpenAiScoringModel::new(
            openai,
            config.scoring_model.clone(),
        ));

        Self::with_providers(db, config, embeddings, vector_index, enrichment, scoring)
    }

    /// Build the kernel with explicit providers (tests use fixture-backed ones).
    pub fn with_providers(
        db: PgPool,
        config: Config,
        embeddings: Arc<dyn EmbeddingProvider>,
        vector_index: Arc<dyn VectorIndex>,
        enrichment: Arc<dyn EnrichmentProvider>,
        scoring: Arc<dyn ScoringModel>,
    ) -> Self {
        Self {
            db,
            config,
            embeddings,
            vector_index,
            enrichment,
            scoring,
            scoring_semaphore: Arc::new(Semaphore::new(SCORING_CONCURRENCY)),
        }
    }
}
