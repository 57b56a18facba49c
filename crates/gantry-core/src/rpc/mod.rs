//! Wire protocol between the gateway and worker processes.
//!
//! Newline-delimited JSON over loopback TCP: one [`WorkerRequest`] per line
//! from the gateway, one [`WorkerReply`] per line from the worker. Replies
//! are correlated by request id; a streaming request produces any number of
//! `Chunk` replies sharing the request id, terminated by `StreamEnd` or
//! `Error`.

mod client;

pub use client::{PredictStream, StreamEvent, WorkerClient};

use serde::{Deserialize, Serialize};

/// Request sent from the gateway to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Monotonic request id. 0 = fire-and-forget.
    pub id: u64,
    pub command: WorkerCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerCommand {
    /// Readiness probe; answered as soon as the worker is serving.
    Health,
    /// One-shot model load. A second Load against the same worker is
    /// undefined; the loader never issues one.
    Load { options: ModelOptions },
    /// Synchronous completion.
    Predict { options: PredictOptions },
    /// Server-streamed completion.
    PredictStream { options: PredictOptions },
    Embed { text: String },
    Tts {
        text: String,
        voice: Option<String>,
        destination: Option<String>,
    },
    Transcribe {
        audio_path: String,
        language: Option<String>,
        threads: Option<usize>,
    },
    GenerateImage { options: ImageOptions },
    Status,
    /// Best-effort graceful shutdown.
    Stop,
    /// Abort the in-flight request with the given id.
    Cancel { request: u64 },
}

/// Reply sent from a worker to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
    /// Matches the request id. 0 for unsolicited messages.
    pub id: u64,
    pub payload: WorkerPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerPayload {
    Ok,
    Completion {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
    /// One streamed token chunk.
    Chunk { message: String },
    /// Normal end of a streamed completion.
    StreamEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
    Embedding { values: Vec<f32> },
    Audio { path: String },
    Image { path: String },
    Segments { segments: Vec<TranscriptSegment> },
    Status {
        memory_bytes: u64,
        busy: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
    Error { message: String },
}

/// Everything a worker needs at model-load time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOptions {
    pub model: String,
    pub context_size: usize,
    pub threads: usize,
    pub f16: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Prompt plus generation parameters for one completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictOptions {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typical_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tfz: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageOptions {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    pub start: f32,
    pub end: f32,
    pub text: String,
}

/// Result of a synchronous completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub finish_reason: Option<String>,
}

/// Worker-reported status.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub memory_bytes: u64,
    pub busy: bool,
    pub finish_reason: Option<String>,
}

#[cfg(test)]
pub(crate) mod fake;
