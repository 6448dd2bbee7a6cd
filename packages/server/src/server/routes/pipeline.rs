//! Pipeline admission and job-query endpoints.

use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::common::{ApiError, ApiResult};
use crate::domains::pipeline::SearchRequest;
use crate::kernel::artifacts::{ArtifactKind, JobArtifact};
use crate::kernel::events::{EventLevel, JobEvent};
use crate::kernel::jobs::{JobStatus, PipelineJob};
use crate::kernel::{IdempotencyKey, RateLimiter};
use crate::server::app::AppState;
use crate::server::middleware::{Principal, RequestId};

const SUBMIT_SCOPE: &str = "pipeline_start";
const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// `POST /pipeline/start` — validate, enforce caps and rate limits, create
/// the pending job row (which is also the queue entry), and ack with 202.
pub async fn start_pipeline(
    Extension(state): Extension<AppState>,
    Extension(request_id): Extension<RequestId>,
    Principal(api_key): Principal,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let db = &state.kernel.db;

    // Input validation
    let request: SearchRequest = serde_json::from_value(body)
        .map_err(|e| ApiError::Validation(format!("invalid request body: {e}")))?;
    let params = request.validate().map_err(ApiError::Validation)?;

    // Active-job cap
    let active = PipelineJob::count_active_for_key(api_key.id, db).await?;
    if active >= state.kernel.config.max_active_jobs_per_key {
        return Err(ApiError::OverCap);
    }

    // Idempotent replay
    let idem_key = match headers.get("idempotency-key") {
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| ApiError::Validation("malformed Idempotency-Key header".into()))?;
            if raw.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(ApiError::Validation(format!(
                    "Idempotency-Key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"
                )));
            }
            Some(raw.to_string())
        }
        None => None,
    };
    if let Some(key) = &idem_key {
        if let Some(existing) = IdempotencyKey::get(api_key.id, key, db).await? {
            return Ok(accepted_response(existing, request_id, None, true));
        }
    }

    // Rate limit
    let decision = RateLimiter::check(
        api_key.id,
        SUBMIT_SCOPE,
        api_key.rate_rps,
        api_key.burst,
        db,
    )
    .await?;
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            scope: SUBMIT_SCOPE.into(),
            remaining: decision.remaining,
        });
    }

    // Create the job; inserting the pending row is the enqueue. With an
    // idempotency key, the mapping reservation and the insert share one
    // transaction: the upsert's row lock picks a single winner, and a losing
    // request rolls back without ever creating a claimable job row.
    let candidate = PipelineJob::builder()
        .api_key_id(api_key.id)
        .params(serde_json::to_value(&params).map_err(anyhow::Error::from)?)
        .build();
    let job_id = candidate.job_id;

    let job = match &idem_key {
        Some(key) => {
            let mut tx = db.begin().await?;
            let stored = IdempotencyKey::put(api_key.id, key, job_id, &mut *tx).await?;
            if stored != job_id {
                // A concurrent submit won the key; surface its job instead
                tx.rollback().await?;
                return Ok(accepted_response(
                    stored,
                    request_id,
                    Some(decision.remaining),
                    true,
                ));
            }
            let job = candidate.insert(&mut *tx).await?;
            tx.commit().await?;
            job
        }
        None => candidate.insert(db).await?,
    };

    JobEvent::append(
        job.job_id,
        EventLevel::Info,
        "job_accepted",
        json!({"top_n": params.top_n, "platform": params.platform}),
        db,
    )
    .await?;

    tracing::info!(job_id = %job.job_id, api_key = %api_key.name, "pipeline job accepted");
    Ok(accepted_response(
        job.job_id,
        request_id,
        Some(decision.remaining),
        false,
    ))
}

fn accepted_response(
    job_id: Uuid,
    request_id: RequestId,
    rate_remaining: Option<f64>,
    replay: bool,
) -> Response {
    let mut body = json!({
        "job_id": job_id,
        "status": "accepted",
        "request_id": request_id.0,
    });
    if replay {
        body["idempotent_replay"] = json!(true);
    }

    let mut response = (StatusCode::ACCEPTED, Json(body)).into_response();
    if let Some(remaining) = rate_remaining {
        let headers = response.headers_mut();
        headers.insert("X-RateLimit-Scope", HeaderValue::from_static(SUBMIT_SCOPE));
        let remaining = remaining.floor().max(0.0) as u64;
        headers.insert(
            "X-RateLimit-Remaining",
            HeaderValue::from_str(&remaining.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
    }
    response
}

/// `GET /pipeline/jobs/:id` — job projection, owner-scoped.
pub async fn get_job(
    Extension(state): Extension<AppState>,
    Principal(api_key): Principal,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let job = PipelineJob::find_owned(job_id, api_key.id, &state.kernel.db)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(job.projection()))
}

/// `GET /pipeline/jobs/:id/results` — the final artifact, or 409 until the
/// job completes.
pub async fn get_results(
    Extension(state): Extension<AppState>,
    Principal(api_key): Principal,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let db = &state.kernel.db;
    let job = PipelineJob::find_owned(job_id, api_key.id, db)
        .await?
        .ok_or(ApiError::NotFound)?;

    if job.status != JobStatus::Completed {
        return Err(ApiError::Conflict(format!(
            "job is {}, results are available once completed",
            job.status.as_str()
        )));
    }

    let artifact = JobArtifact::get(job_id, ArtifactKind::Final, db)
        .await?
        .ok_or_else(|| {
            ApiError::Internal(anyhow::anyhow!("completed job {job_id} has no final artifact"))
        })?;

    Ok(Json(artifact.data))
}

/// `GET /pipeline/jobs/:id/artifacts/:kind` for the preview kinds
/// (candidates, progressive, remaining, timing).
pub async fn get_artifact(
    Extension(state): Extension<AppState>,
    Principal(api_key): Principal,
    Path((job_id, kind)): Path<(Uuid, String)>,
) -> ApiResult<Json<Value>> {
    let db = &state.kernel.db;

    let kind = ArtifactKind::parse(&kind)
        .filter(ArtifactKind::client_fetchable)
        .ok_or_else(|| ApiError::Validation(format!("invalid artifact kind '{kind}'")))?;

    PipelineJob::find_owned(job_id, api_key.id, db)
        .await?
        .ok_or(ApiError::NotFound)?;

    let artifact = JobArtifact::get(job_id, kind, db)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(artifact.data))
}

/// `POST /pipeline/jobs/:id/cancel` — set the soft cancellation signal.
pub async fn cancel_job(
    Extension(state): Extension<AppState>,
    Principal(api_key): Principal,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let db = &state.kernel.db;
    PipelineJob::find_owned(job_id, api_key.id, db)
        .await?
        .ok_or(ApiError::NotFound)?;

    let requested = PipelineJob::request_cancel(job_id, db).await?;
    if !requested {
        return Err(ApiError::Conflict("job is already terminal".into()));
    }

    JobEvent::append(
        job_id,
        EventLevel::Info,
        "cancel_requested",
        json!({}),
        db,
    )
    .await?;

    tracing::info!(job_id = %job_id, "cancellation requested");
    Ok(Json(json!({"job_id": job_id, "status": "cancel_requested"})))
}
