// Main entry point for the creator-scout server

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server_core::kernel::jobs::{PipelineQueue, PipelineWorker, WorkerConfig, DEFAULT_LEASE_SECS};
use server_core::kernel::{cleanup, Config, ServerKernel};
use server_core::server::build_app;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// HTTP admission service only
    Server,
    /// Pipeline worker only
    Worker,
    /// Both in one process
    All,
}

#[derive(Parser)]
#[command(name = "server", about = "Creator Scout pipeline server")]
struct Args {
    #[arg(long, value_enum, default_value = "all")]
    role: Role,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!(role = ?args.role, "starting Creator Scout");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("configuration loaded");

    // Connect to database
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("database connected");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("migrations complete");

    let kernel = Arc::new(ServerKernel::new(pool.clone(), config.clone()));

    // Readiness-check the vector index once at startup; later calls tolerate
    // reconnection
    if !kernel.vector_index.ready().await {
        tracing::warn!("vector index not ready at startup; /health will report degraded");
    }

    let shutdown = CancellationToken::new();
    let mut worker_handle = None;

    if args.role != Role::Server {
        let queue = Arc::new(PipelineQueue::new(pool.clone(), DEFAULT_LEASE_SECS));
        let worker = PipelineWorker::new(
            kernel.clone(),
            queue,
            WorkerConfig {
                concurrency: config.worker_concurrency,
                ..WorkerConfig::default()
            },
        );
        let worker_shutdown = shutdown.clone();
        worker_handle = Some(tokio::spawn(async move {
            if let Err(e) = worker.run(worker_shutdown).await {
                tracing::error!(error = %e, "pipeline worker exited with error");
            }
        }));
    }

    // Retention sweeps run wherever a process is up
    let _scheduler = cleanup::start_scheduler(pool.clone(), config.job_retention_days)
        .await
        .context("Failed to start cleanup scheduler")?;

    if args.role == Role::Worker {
        tracing::info!("worker-only mode; waiting for shutdown signal");
        tokio::signal::ctrl_c().await?;
        shutdown.cancel();
        if let Some(handle) = worker_handle {
            let _ = handle.await;
        }
        return Ok(());
    }

    // Build and serve the HTTP app
    let app = build_app(kernel);
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("listening on {addr}");
    tracing::info!("health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            serve_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Some(handle) = worker_handle {
        let _ = handle.await;
    }

    Ok(())
}
