//! OpenAI-compatible chat completions.

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

use gantry_core::{ChatMessage, ChatOutcome, GenerationOverrides, StreamEvent};

use crate::api::openai::{now_unix_secs, parse_stop};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub stop: Option<serde_json::Value>,
    #[serde(default)]
    pub grammar: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<Choice>,
}

#[derive(Debug, Serialize)]
struct Choice {
    index: usize,
    message: AssistantMessage,
    finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct AssistantMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Serialize)]
struct ToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: ToolCallFunction,
}

#[derive(Debug, Serialize)]
struct ToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatChunk {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
struct ChunkChoice {
    index: usize,
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

fn overrides_from(req: &ChatCompletionRequest) -> GenerationOverrides {
    GenerationOverrides {
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        max_tokens: req.max_tokens,
        seed: req.seed,
        frequency_penalty: req.frequency_penalty,
        presence_penalty: req.presence_penalty,
        stop: parse_stop(req.stop.as_ref()),
        grammar: req.grammar.clone(),
    }
}

fn to_core_messages(messages: &[InboundMessage]) -> Result<Vec<ChatMessage>, ApiError> {
    if messages.is_empty() {
        return Err(ApiError::bad_request(
            "chat request must include at least one message",
        ));
    }
    messages
        .iter()
        .map(|m| {
            if m.content.trim().is_empty() {
                return Err(ApiError::bad_request("chat message content cannot be empty"));
            }
            Ok(ChatMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
        })
        .collect()
}

pub async fn completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let messages = to_core_messages(&req.messages)?;

    if req.stream.unwrap_or(false) {
        return Ok(complete_stream(state, req, messages).await.into_response());
    }

    let overrides = overrides_from(&req);
    let cancel = CancellationToken::new();
    let outcome = state
        .app
        .dispatcher
        .model_chat(&req.model, &messages, &overrides, &cancel)
        .await
        .map_err(|err| state.api_error(err))?;

    let (message, finish_reason) = match outcome {
        ChatOutcome::Text(text) => (
            AssistantMessage {
                role: "assistant",
                content: Some(text),
                tool_calls: None,
            },
            "stop",
        ),
        ChatOutcome::ToolCall { name, arguments } => (
            AssistantMessage {
                role: "assistant",
                content: None,
                tool_calls: Some(vec![ToolCall {
                    id: format!("call_{}", Uuid::new_v4().simple()),
                    kind: "function",
                    function: ToolCallFunction {
                        name,
                        arguments: arguments.to_string(),
                    },
                }]),
            },
            "tool_calls",
        ),
    };

    let response = ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
        object: "chat.completion",
        created: now_unix_secs(),
        model: req.model,
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason,
        }],
    };
    Ok(Json(response).into_response())
}

async fn complete_stream(
    state: AppState,
    req: ChatCompletionRequest,
    messages: Vec<ChatMessage>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let completion_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = now_unix_secs();
    let model = req.model.clone();
    let overrides = overrides_from(&req);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();
    let dispatcher = state.app.dispatcher.clone();
    let opaque = state.app.opts.opaque_errors;

    tokio::spawn(async move {
        let chunk = |delta: Delta, finish_reason: Option<String>| ChatChunk {
            id: completion_id.clone(),
            object: "chat.completion.chunk",
            created,
            model: model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        };

        let cancel = CancellationToken::new();
        let mut stream = match dispatcher
            .model_chat_stream(&req.model, &messages, &overrides, &cancel)
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

        let start = chunk(
            Delta {
                role: Some("assistant"),
                content: None,
            },
            None,
        );
        if event_tx
            .send(serde_json::to_string(&start).unwrap_or_default())
            .is_err()
        {
            // Consumer disconnected; dropping the stream cancels the worker.
            return;
        }

        while let Some(event) = stream.next().await {
            let payload = match event {
                StreamEvent::Chunk(content) => serde_json::to_string(&chunk(
                    Delta {
                        role: None,
                        content: Some(content),
                    },
                    None,
                ))
                .unwrap_or_default(),
                StreamEvent::End { finish_reason } => {
                    let done = chunk(
                        Delta {
                            role: None,
                            content: None,
                        },
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
