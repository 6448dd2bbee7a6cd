//! API error taxonomy and HTTP mapping.
//!
//! One enum covers every failure kind the synchronous surface can return;
//! handlers bubble errors with `?` and the `IntoResponse` impl renders the
//! JSON body. Internal errors are logged with their chain and surfaced as an
//! opaque 500.
//!
//! Error bodies are `{error, message, request_id}`. `IntoResponse` has no
//! view of the request, so it records the kind and message in a response
//! extension ([`ErrorBody`]) and the request-id middleware rewrites the body
//! with the originating id merged in.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Render an error with its full context chain, for stage-scoped messages.
pub fn error_chain(e: &anyhow::Error) -> String {
    format!("{e:#}")
}

/// Response extension set on every `ApiError` response so the request-id
/// layer can rebuild the JSON body with the request id included.
#[derive(Clone, Debug)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// Request shape or bounds violate the contract
    #[error("{0}")]
    Validation(String),

    /// Missing or invalid credentials
    #[error("missing or invalid API key")]
    Auth,

    /// Job does not exist for this caller (ownership mismatch included)
    #[error("job not found")]
    NotFound,

    /// Operation illegal for the current status
    #[error("{0}")]
    Conflict(String),

    /// Token bucket empty for this principal/scope
    #[error("rate limit exceeded")]
    RateLimited { scope: String, remaining: f64 },

    /// Active-job cap reached
    #[error("too many active jobs for this API key")]
    OverCap,

    /// Anything unexpected; details stay in the logs
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Stable machine-readable kind for response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation",
            ApiError::Auth => "auth",
            ApiError::NotFound => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::OverCap => "over_cap",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Auth => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } | ApiError::OverCap => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(anyhow::Error::new(e).context("database error"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(e) => {
                tracing::error!(error = ?e, "internal error serving request");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": self.kind(),
            "message": message.clone(),
        }));

        let mut response = (status, body).into_response();
        response.extensions_mut().insert(ErrorBody {
            kind: self.kind(),
            message,
        });

        if let ApiError::RateLimited { scope, remaining } = &self {
            let headers = response.headers_mut();
            if let Ok(v) = HeaderValue::from_str(scope) {
                headers.insert("X-RateLimit-Scope", v);
            }
            let remaining = remaining.floor().max(0.0) as u64;
            headers.insert(
                "X-RateLimit-Remaining",
                HeaderValue::from_str(&remaining.to_string())
                    .unwrap_or_else(|_| HeaderValue::from_static("0")),
            );
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Auth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Conflict("terminal".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::RateLimited {
                scope: "pipeline_start".into(),
                remaining: 0.0
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ApiError::OverCap.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn rate_limited_response_carries_headers() {
        let response = ApiError::RateLimited {
            scope: "pipeline_start".into(),
            remaining: 2.7,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("X-RateLimit-Scope").unwrap(),
            "pipeline_start"
        );
        assert_eq!(response.headers().get("X-RateLimit-Remaining").unwrap(), "2");
    }

    #[test]
    fn internal_errors_hide_details() {
        let response = ApiError::Internal(anyhow::anyhow!("secret connection string")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let error_body = response.extensions().get::<ErrorBody>().unwrap();
        assert_eq!(error_body.message, "internal server error");
    }

    #[test]
    fn responses_carry_the_error_body_extension() {
        let response = ApiError::Validation("top_n out of range".into()).into_response();
        let error_body = response.extensions().get::<ErrorBody>().unwrap();
        assert_eq!(error_body.kind, "validation");
        assert_eq!(error_body.message, "top_n out of range");
    }
}
