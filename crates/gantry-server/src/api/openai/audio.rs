//! OpenAI-compatible audio endpoints: speech synthesis and transcription.

use axum::{
    body::Body,
    extract::{Multipart, State},
    http::header,
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gantry_core::TranscriptSegment;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    #[serde(default)]
    pub voice: Option<String>,
    /// Backend override, e.g. "piper".
    #[serde(default)]
    pub backend: Option<String>,
}

/// Generate speech and stream the audio file back.
pub async fn speech(
    State(state): State<AppState>,
    Json(req): Json<SpeechRequest>,
) -> Result<Response, ApiError> {
    if req.input.trim().is_empty() {
        return Err(ApiError::bad_request("input text cannot be empty"));
    }

    let cancel = CancellationToken::new();
    let path = state
        .app
        .dispatcher
        .model_tts(
            req.backend.as_deref(),
            &req.model,
            &req.input,
            req.voice.as_deref(),
            &cancel,
        )
        .await
        .map_err(|err| state.api_error(err))?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|err| state.api_error(err.into()))?;
    Response::builder()
        .header(header::CONTENT_TYPE, "audio/wav")
        .body(Body::from(bytes))
        .map_err(|err| ApiError::internal(err.to_string()))
}

#[derive(Debug, Serialize)]
pub struct TranscriptionResponse {
    text: String,
    segments: Vec<TranscriptSegment>,
}

/// Multipart transcription: `file` plus optional `model` and `language`
/// fields. The upload is staged under the upload dir and removed afterwards.
pub async fn transcriptions(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<TranscriptionResponse>, ApiError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut file_name = String::from("upload.wav");
    let mut model: Option<String> = None;
    let mut language: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                if let Some(name) = field.file_name() {
                    file_name = name.to_string();
                }
                file_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|err| ApiError::bad_request(err.to_string()))?
                        .to_vec(),
                );
            }
            "model" => {
                model = Some(
                    field
                        .text()
                        .await
                        .map_err(|err| ApiError::bad_request(err.to_string()))?,
                )
            }
            "language" => {
                language = Some(
                    field
                        .text()
                        .await
                        .map_err(|err| ApiError::bad_request(err.to_string()))?,
                )
            }
            _ => {}
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| ApiError::bad_request("missing `file` field"))?;
    let model = model.ok_or_else(|| ApiError::bad_request("missing `model` field"))?;

    let staged = state
        .app
        .opts
        .upload_path
        .join(format!("tmp-{}-{file_name}", Uuid::new_v4()));
    tokio::fs::write(&staged, &file_bytes)
        .await
        .map_err(|err| state.api_error(err.into()))?;

    let cancel = CancellationToken::new();
    let result = state
        .app
        .dispatcher
        .model_transcription(&model, &staged, language.as_deref(), None, &cancel)
        .await;
    let _ = tokio::fs::remove_file(&staged).await;

    let segments = result.map_err(|err| state.api_error(err))?;
    let text = segments
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    Ok(Json(TranscriptionResponse { text, segments }))
}
