//! Test harness with a shared testcontainers Postgres.
//!
//! The container starts once on the first test and is reused; migrations run
//! once. Each test scopes its data to its own API key and job ids.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::sync::OnceCell;

use server_core::kernel::config::{Config, EmbeddingsProvider};
use server_core::kernel::providers::{
    EmbeddingProvider, EnrichmentProvider, ScoringModel, VectorIndex,
};
use server_core::kernel::ServerKernel;
use server_core::server::build_app;

struct SharedTestInfra {
    db_url: String,
    _postgres: ContainerAsync<GenericImage>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = GenericImage::new("postgres", "16-alpine")
            .with_wait_for(WaitFor::message_on_stderr(
                "database system is ready to accept connections",
            ))
            .with_exposed_port(ContainerPort::Tcp(5432))
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_DB", "postgres")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect for migrations")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }
}

/// Connect to the shared test database.
pub async fn test_pool() -> PgPool {
    let infra = SHARED_INFRA
        .get_or_try_init(SharedTestInfra::init)
        .await
        .expect("shared test infrastructure failed to start");
    PgPool::connect(&infra.db_url)
        .await
        .expect("failed to connect to test database")
}

/// Config for tests; provider settings are never dialed because fixtures
/// stand in for every external.
pub fn test_config() -> Config {
    Config {
        database_url: String::new(),
        port: 0,
        openai_api_key: "test-key".into(),
        scoring_model: "test-model".into(),
        embeddings_model: "test-embeddings".into(),
        embeddings_provider: EmbeddingsProvider::Primary,
        secondary_embeddings_base_url: None,
        secondary_embeddings_api_key: None,
        secondary_embeddings_model: None,
        weaviate_url: "http://localhost:8080".into(),
        weaviate_api_key: None,
        weaviate_collection: "Creator".into(),
        weaviate_timeout_secs: 120,
        brightdata_api_key: "test-key".into(),
        brightdata_dataset_instagram: "gd_test_instagram".into(),
        brightdata_dataset_tiktok: "gd_test_tiktok".into(),
        max_active_jobs_per_key: 3,
        worker_concurrency: 1,
        job_retention_days: 7,
        cache_ttl_days: 14,
    }
}

/// A kernel over the shared database with fixture providers.
pub async fn test_kernel(
    embeddings: Arc<dyn EmbeddingProvider>,
    vector_index: Arc<dyn VectorIndex>,
    enrichment: Arc<dyn EnrichmentProvider>,
    scoring: Arc<dyn ScoringModel>,
) -> Arc<ServerKernel> {
    let pool = test_pool().await;
    Arc::new(ServerKernel::with_providers(
        pool,
        test_config(),
        embeddings,
        vector_index,
        enrichment,
        scoring,
    ))
}

/// The HTTP app over a fixture kernel.
pub fn test_app(kernel: Arc<ServerKernel>) -> axum::Router {
    build_app(kernel)
}
