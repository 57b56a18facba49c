//! OpenAI-compatible embeddings.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingResponse {
    object: &'static str,
    model: String,
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Serialize)]
struct EmbeddingData {
    object: &'static str,
    index: usize,
    embedding: Vec<f32>,
}

fn inputs(raw: &serde_json::Value) -> Result<Vec<String>, ApiError> {
    match raw {
        serde_json::Value::String(s) => Ok(vec![s.clone()]),
        serde_json::Value::Array(items) => {
            let texts: Vec<String> = items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            if texts.is_empty() {
                Err(ApiError::bad_request("input array must contain strings"))
            } else {
                Ok(texts)
            }
        }
        _ => Err(ApiError::bad_request("input must be a string or an array")),
    }
}

pub async fn embeddings(
    State(state): State<AppState>,
    Json(req): Json<EmbeddingRequest>,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    let texts = inputs(&req.input)?;
    let cancel = CancellationToken::new();

    let mut data = Vec::with_capacity(texts.len());
    for (index, text) in texts.iter().enumerate() {
        let embedding = state
            .app
            .dispatcher
            .model_embedding(&req.model, text, &cancel)
            .await
            .map_err(|err| state.api_error(err))?;
        data.push(EmbeddingData {
            object: "embedding",
            index,
            embedding,
        });
    }

    Ok(Json(EmbeddingResponse {
        object: "list",
        model: req.model,
        data,
    }))
}
