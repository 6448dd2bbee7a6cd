use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::{extract::Extension, middleware::Next, response::Response};
use tracing::debug;

use crate::common::ApiError;
use crate::kernel::ApiKey;
use crate::server::app::AppState;

/// The authenticated principal for this request.
#[derive(Clone, Debug)]
pub struct Principal(pub ApiKey);

/// API key authentication middleware.
///
/// Resolves `X-API-Key` (or `Authorization: Bearer`) to a principal by hash
/// lookup and stores it in request extensions. Requests without a valid key
/// continue unauthenticated; handlers that need a principal reject them via
/// the `Principal` extractor.
pub async fn api_key_auth_middleware(
    Extension(state): Extension<AppState>,
    mut request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(raw_key) = extract_raw_key(&request) {
        match ApiKey::find_by_raw_key(&raw_key, &state.kernel.db).await {
            Ok(Some(api_key)) => {
                debug!(api_key = %api_key.name, "authenticated principal");
                request.extensions_mut().insert(Principal(api_key));
            }
            Ok(None) => debug!("unknown or revoked API key"),
            Err(e) => tracing::error!(error = %e, "api key lookup failed"),
        }
    }

    next.run(request).await
}

/// Pull the raw key from `X-API-Key` or an `Authorization` bearer header.
fn extract_raw_key(request: &axum::http::Request<axum::body::Body>) -> Option<String> {
    if let Some(value) = request.headers().get("x-api-key") {
        return value.to_str().ok().map(str::to_string);
    }

    let auth = request.headers().get("authorization")?.to_str().ok()?;
    Some(auth.strip_prefix("Bearer ").unwrap_or(auth).to_string())
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or(ApiError::Auth)
    }
}
