//! Bearer-token authentication middleware.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::error::ApiError;
use crate::state::AppState;

/// Reject every request without a configured bearer token. A no-op when no
/// API keys are configured.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let keys = &state.app.opts.api_keys;
    if keys.is_empty() {
        return Ok(next.run(request).await);
    }

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| keys.iter().any(|key| key == token))
        .unwrap_or(false);

    if authorized {
        Ok(next.run(request).await)
    } else {
        Err(ApiError::unauthorized().opaque(state.app.opts.opaque_errors))
    }
}
