//! OpenAI-compatible text completions.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::{sse::Event, IntoResponse, Response, Sse},
    Json,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gantry_core::{GenerationOverrides, StreamEvent};

use crate::api::openai::{now_unix_secs, parse_stop};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: serde_json::Value,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub stop: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct CompletionResponse {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<Choice>,
}

#[derive(Debug, Serialize)]
struct Choice {
    index: usize,
    text: String,
    finish_reason: Option<String>,
}

fn prompt_text(raw: &serde_json::Value) -> Result<String, ApiError> {
    match raw {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(|v| v.as_str()).collect();
            if parts.is_empty() {
                Err(ApiError::bad_request("prompt array must contain strings"))
            } else {
                Ok(parts.join("\n"))
            }
        }
        _ => Err(ApiError::bad_request("prompt must be a string or an array")),
    }
}

fn overrides_from(req: &CompletionRequest) -> GenerationOverrides {
    GenerationOverrides {
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        seed: req.seed,
        stop: parse_stop(req.stop.as_ref()),
        ..Default::default()
    }
}

pub async fn completions(
    State(state): State<AppState>,
    Json(req): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    let prompt = prompt_text(&req.prompt)?;

    if req.stream.unwrap_or(false) {
        return Ok(complete_stream(state, req, prompt).await.into_response());
    }

    let overrides = overrides_from(&req);
    let cancel = CancellationToken::new();
    let text = state
        .app
        .dispatcher
        .model_completion(&req.model, &prompt, &overrides, &cancel)
        .await
        .map_err(|err| state.api_error(err))?;

    let response = CompletionResponse {
        id: format!("cmpl-{}", Uuid::new_v4().simple()),
        object: "text_completion",
        created: now_unix_secs(),
        model: req.model,
        choices: vec![Choice {
            index: 0,
            text,
            finish_reason: Some("stop".into()),
        }],
    };
    Ok(Json(response).into_response())
}

async fn complete_stream(
    state: AppState,
    req: CompletionRequest,
    prompt: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let completion_id = format!("cmpl-{}", Uuid::new_v4().simple());
    let created = now_unix_secs();
    let model = req.model.clone();
    let overrides = overrides_from(&req);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();
    let dispatcher = state.app.dispatcher.clone();
    let opaque = state.app.opts.opaque_errors;

    tokio::spawn(async move {
        let chunk = |text: String, finish_reason: Option<String>| CompletionResponse {
            id: completion_id.clone(),
            object: "text_completion",
            created,
            model: model.clone(),
            choices: vec![Choice {
                index: 0,
                text,
                finish_reason,
            }],
        };

        let cancel = CancellationToken::new();
        let mut stream = match dispatcher
            .model_completion_stream(&req.model, &prompt, &overrides, &cancel)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                let message = if opaque { "server error".into() } else { err.to_string() };
                let _ = event_tx.send(
                    serde_json::json!({
                        "error": { "message": message, "type": "server_error" }
                    })
                    .to_string(),
                );
                let _ = event_tx.send("[DONE]".to_string());
                return;
            }
        };

        while let Some(event) = stream.next().await {
            let payload = match event {
                StreamEvent::Chunk(text) => {
                    serde_json::to_string(&chunk(text, None)).unwrap_or_default()
                }
                StreamEvent::End { finish_reason } => {
                    let done = chunk(
                        String::new(),
                        Some(finish_reason.unwrap_or_else(|| "stop".into())),
                    );
                    let _ = event_tx.send(serde_json::to_string(&done).unwrap_or_default());
                    break;
                }
                StreamEvent::Error(err) => {
                    let message = if opaque { "server error".into() } else { err };
                    serde_json::json!({
                        "error": { "message": message, "type": "server_error" }
                    })
                    .to_string()
                }
            };
            if event_tx.send(payload).is_err() {
                return;
            }
        }

        let _ = event_tx.send("[DONE]".to_string());
    });

    let stream = async_stream::stream! {
        while let Some(event) = event_rx.recv().await {
            yield Ok(Event::default().data(event.clone()));
            if event == "[DONE]" {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default())
}
