//! Live backend status.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use gantry_core::InstanceStatus;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/models/status", get(backend_status))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub backends: Vec<InstanceStatus>,
}

async fn backend_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        backends: state.app.loader.status().await,
    })
}
