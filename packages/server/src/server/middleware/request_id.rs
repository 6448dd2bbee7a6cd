use axum::http::{header, HeaderValue};
use axum::{middleware::Next, response::Response};
use serde_json::json;
use uuid::Uuid;

use crate::common::error::ErrorBody;

/// Per-request id: merged into every error body, echoed in the
/// `X-Request-Id` response header, and surfaced in the submit response body.
#[derive(Clone, Copy, Debug)]
pub struct RequestId(pub Uuid);

/// Assigns the request id and finishes error bodies.
///
/// `ApiError::into_response` cannot see the request, so it leaves its kind
/// and message in an [`ErrorBody`] response extension; this layer rebuilds
/// those bodies as `{error, message, request_id}`.
pub async fn request_id_middleware(
    mut request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let request_id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;

    if let Some(error_body) = response.extensions().get::<ErrorBody>().cloned() {
        let (mut parts, _) = response.into_parts();
        // The rebuilt body has a different length; let hyper recompute it
        parts.headers.remove(header::CONTENT_LENGTH);
        let body = json!({
            "error": error_body.kind,
            "message": error_body.message,
            "request_id": request_id.0,
        });
        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        response = Response::from_parts(parts, axum::body::Body::from(bytes));
    }

    if let Ok(value) = HeaderValue::from_str(&request_id.0.to_string()) {
        response.headers_mut().insert("X-Request-Id", value);
    }
    response
}
