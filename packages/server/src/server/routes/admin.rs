//! Admin inspector: recent jobs and provider cost/usage aggregation.
//!
//! Admin-only; for non-admin keys every route here is a 404, the same as an
//! unknown path.

use axum::extract::{Extension, Path, Query};
use axum::Json;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::common::{ApiError, ApiResult};
use crate::kernel::jobs::{JobStatus, PipelineJob};
use crate::kernel::{ApiKey, ServiceUsage};
use crate::server::app::AppState;
use crate::server::middleware::Principal;

fn require_admin(api_key: &ApiKey) -> ApiResult<()> {
    if api_key.is_admin {
        Ok(())
    } else {
        Err(ApiError::NotFound)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

/// `GET /admin/jobs?status=&limit=` — recent jobs across all keys.
pub async fn list_jobs(
    Extension(state): Extension<AppState>,
    Principal(api_key): Principal,
    Query(query): Query<JobsQuery>,
) -> ApiResult<Json<Value>> {
    require_admin(&api_key)?;

    let status = match &query.status {
        Some(raw) => Some(
            serde_json::from_value::<JobStatus>(json!(raw))
                .map_err(|_| ApiError::Validation(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 500);

    let jobs = PipelineJob::find_recent(status, limit, &state.kernel.db).await?;
    let projections: Vec<Value> = jobs.iter().map(PipelineJob::projection).collect();

    Ok(Json(json!({"jobs": projections})))
}

/// `GET /admin/jobs/:id` — the full row, any owner.
pub async fn get_job(
    Extension(state): Extension<AppState>,
    Principal(api_key): Principal,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    require_admin(&api_key)?;

    let job = PipelineJob::find_by_id(job_id, &state.kernel.db)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(serde_json::to_value(&job).map_err(anyhow::Error::from)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct UsageQuery {
    pub since: Option<chrono::DateTime<Utc>>,
}

/// `GET /admin/usage?since=` — external-call counts and cost estimates per
/// service (default window: the last 30 days).
pub async fn usage(
    Extension(state): Extension<AppState>,
    Principal(api_key): Principal,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Json<Value>> {
    require_admin(&api_key)?;

    let since = query.since.unwrap_or_else(|| Utc::now() - Duration::days(30));
    let usage = ServiceUsage::since(since, &state.kernel.db).await?;
    let total_cost: f64 = usage.iter().map(|u| u.total_cost_usd).sum();

    Ok(Json(json!({
        "since": since,
        "services": usage,
        "total_cost_usd": total_cost,
    })))
}
