//! HTTP routing.

pub mod gallery;
pub mod openai;
pub mod status;

use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .merge(openai::router())
        .merge(gallery::router())
        .merge(status::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .layer(TraceLayer::new_for_http());

    if state.app.opts.cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.with_state(state)
}
