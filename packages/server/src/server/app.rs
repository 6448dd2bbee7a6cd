//! Application setup and router assembly.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method,
    },
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::ServerKernel;
use crate::server::middleware::{api_key_auth_middleware, request_id_middleware};
use crate::server::routes::{admin, events, health, pipeline, search};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<ServerKernel>,
}

/// Build the Axum application router.
pub fn build_app(kernel: Arc<ServerKernel>) -> Router {
    let app_state = AppState { kernel };

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    Router::new()
        // Pipeline surface
        .route("/pipeline/start", post(pipeline::start_pipeline))
        .route("/pipeline/jobs/:job_id", get(pipeline::get_job))
        .route("/pipeline/jobs/:job_id/results", get(pipeline::get_results))
        .route(
            "/pipeline/jobs/:job_id/artifacts/:kind",
            get(pipeline::get_artifact),
        )
        .route("/pipeline/jobs/:job_id/events", get(events::job_events))
        .route("/pipeline/jobs/:job_id/cancel", post(pipeline::cancel_job))
        // Auxiliary direct search
        .route("/weaviate/search", post(search::weaviate_search))
        // Admin inspector
        .route("/admin/jobs", get(admin::list_jobs))
        .route("/admin/jobs/:job_id", get(admin::get_job))
        .route("/admin/usage", get(admin::usage))
        // Health check (no auth)
        .route("/health", get(health::health_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(middleware::from_fn(api_key_auth_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(Extension(app_state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
