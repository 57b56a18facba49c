//! OpenAI-compatible image generation.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::api::openai::now_unix_secs;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    /// "WIDTHxHEIGHT", e.g. "512x512".
    #[serde(default)]
    pub size: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ImageResponse {
    created: u64,
    data: Vec<ImageData>,
}

#[derive(Debug, Serialize)]
struct ImageData {
    url: String,
}

fn parse_size(raw: Option<&str>) -> Result<(u32, u32), ApiError> {
    let raw = raw.unwrap_or("512x512");
    let (w, h) = raw
        .split_once('x')
        .ok_or_else(|| ApiError::bad_request("size must look like 512x512"))?;
    let width = w
        .parse()
        .map_err(|_| ApiError::bad_request("invalid width"))?;
    let height = h
        .parse()
        .map_err(|_| ApiError::bad_request("invalid height"))?;
    Ok((width, height))
}

pub async fn generations(
    State(state): State<AppState>,
    Json(req): Json<ImageRequest>,
) -> Result<Json<ImageResponse>, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt cannot be empty"));
    }
    let (width, height) = parse_size(req.size.as_deref())?;

    let cancel = CancellationToken::new();
    let path = state
        .app
        .dispatcher
        .model_image(&req.model, &req.prompt, width, height, &cancel)
        .await
        .map_err(|err| state.api_error(err))?;

    Ok(Json(ImageResponse {
        created: now_unix_secs(),
        data: vec![ImageData {
            url: path.display().to_string(),
        }],
    }))
}
