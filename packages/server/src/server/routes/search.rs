//! Auxiliary direct vector search, bypassing the pipeline.

use axum::extract::Extension;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::common::{ApiError, ApiResult};
use crate::domains::pipeline::stages::vector_search::merge_hits;
use crate::kernel::providers::{HybridQuery, TargetWeights};
use crate::server::app::AppState;
use crate::server::middleware::Principal;

const DEFAULT_LIMIT: u32 = 50;

#[derive(Debug, Deserialize)]
pub struct DirectSearchRequest {
    pub query: String,
    pub platform: Option<String>,
    pub min_followers: Option<u64>,
    pub max_followers: Option<u64>,
    pub limit: Option<u32>,
    pub alpha: Option<f64>,
}

/// `POST /weaviate/search` — one embedded hybrid query with the same filter
/// semantics as the pipeline's vector-search stage.
pub async fn weaviate_search(
    Extension(state): Extension<AppState>,
    Principal(_api_key): Principal,
    Json(request): Json<DirectSearchRequest>,
) -> ApiResult<Json<Value>> {
    let query_text = request.query.trim().to_string();
    if query_text.is_empty() {
        return Err(ApiError::Validation("query must not be empty".into()));
    }
    let limit = request.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 1000);
    let platform = match &request.platform {
        Some(raw) => Some(
            crate::common::Platform::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown platform '{raw}'")))?,
        ),
        None => None,
    };

    let vectors = state
        .kernel
        .embeddings
        .embed_batch(std::slice::from_ref(&query_text))
        .await?;
    let vector = vectors
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("embedding provider returned nothing")))?;

    let hits = state
        .kernel
        .vector_index
        .hybrid_search(&HybridQuery {
            query: query_text,
            vector,
            alpha: request.alpha.unwrap_or(0.5).clamp(0.0, 1.0),
            limit,
            platform: platform.map(|p| p.as_str().to_string()),
            min_followers: request.min_followers,
            max_followers: request.max_followers,
            target_weights: TargetWeights::default(),
        })
        .await?;

    let candidates = merge_hits(hits, limit as usize);
    Ok(Json(json!({"candidates": candidates})))
}
