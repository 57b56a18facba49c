//! OpenAI-style model listing, fed from the config store snapshot.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ModelList {
    object: &'static str,
    data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
struct ModelEntry {
    id: String,
    object: &'static str,
    owned_by: &'static str,
}

pub async fn list(State(state): State<AppState>) -> Json<ModelList> {
    let data = state
        .app
        .store
        .names()
        .into_iter()
        .map(|id| ModelEntry {
            id,
            object: "model",
            owned_by: "gantry",
        })
        .collect();
    Json(ModelList {
        object: "list",
        data,
    })
}
