//! Request dispatch facade.
//!
//! The surface HTTP handlers call: per-request overrides are applied to the
//! model's config, the prompt is rendered, the loader supplies a live
//! instance, and streams are post-processed for stop sequences before they
//! reach the handler.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{BackendConfig, ConfigStore};
use crate::error::{Error, Result};
use crate::loader::{BackendStream, ModelLoader};
use crate::options::AppOptions;
use crate::rpc::{ImageOptions, PredictOptions, StreamEvent, TranscriptSegment};
use crate::templates::{self, ChatMessage, PromptInputs};

/// Maximum number of re-prompts when a declared-function model produces a
/// malformed tool-call marker.
const MAX_TOOL_REENTRY: usize = 1;

/// Per-request generation overrides; unset fields fall back to the config.
#[derive(Debug, Clone, Default)]
pub struct GenerationOverrides {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
    pub max_tokens: Option<usize>,
    pub seed: Option<i64>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub stop: Vec<String>,
    pub grammar: Option<String>,
}

/// Outcome of a chat completion.
#[derive(Debug, Clone)]
pub enum ChatOutcome {
    Text(String),
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
}

pub struct Dispatcher {
    opts: AppOptions,
    store: Arc<ConfigStore>,
    loader: Arc<ModelLoader>,
}

impl Dispatcher {
    pub fn new(opts: AppOptions, store: Arc<ConfigStore>, loader: Arc<ModelLoader>) -> Self {
        Self {
            opts,
            store,
            loader,
        }
    }

    pub fn loader(&self) -> &Arc<ModelLoader> {
        &self.loader
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    fn config_for(&self, model: &str) -> Result<Arc<BackendConfig>> {
        self.store
            .get(model)
            .ok_or_else(|| Error::ConfigNotFound(model.to_string()))
    }

    fn predict_options(
        &self,
        cfg: &BackendConfig,
        overrides: &GenerationOverrides,
        prompt: String,
    ) -> PredictOptions {
        let p = &cfg.parameters;
        let mut stop = p.stop.clone();
        for extra in &overrides.stop {
            if !stop.contains(extra) {
                stop.push(extra.clone());
            }
        }
        PredictOptions {
            prompt,
            temperature: overrides.temperature.or(p.temperature),
            top_k: overrides.top_k.or(p.top_k),
            top_p: overrides.top_p.or(p.top_p),
            typical_p: p.typical_p,
            tfz: p.tfz,
            frequency_penalty: overrides.frequency_penalty.or(p.frequency_penalty),
            presence_penalty: overrides.presence_penalty.or(p.presence_penalty),
            seed: overrides.seed.or(p.seed),
            batch: p.batch,
            max_tokens: overrides.max_tokens.or(p.max_tokens),
            stop,
            grammar: overrides.grammar.clone().or_else(|| p.grammar.clone()),
        }
    }

    fn chat_prompt(&self, cfg: &BackendConfig, messages: &[ChatMessage]) -> Result<String> {
        let system = messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let input = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");

        match &cfg.template.chat {
            Some(reference) => templates::render(
                &self.opts.models_path,
                reference,
                &PromptInputs {
                    input,
                    system,
                    messages,
                    functions: &serde_json::to_value(&cfg.functions)?,
                },
            ),
            None => Ok(templates::default_chat_prompt(messages)),
        }
    }

    fn completion_prompt(&self, cfg: &BackendConfig, input: &str) -> Result<String> {
        match &cfg.template.completion {
            Some(reference) => templates::render(
                &self.opts.models_path,
                reference,
                &PromptInputs {
                    input,
                    system: "",
                    messages: &[],
                    functions: &serde_json::Value::Null,
                },
            ),
            None => Ok(input.to_string()),
        }
    }

    /// Chat completion. When the config declares functions and the output
    /// carries a tool-call marker, the structured call is returned instead of
    /// text; a malformed marker is re-prompted up to the re-entry depth.
    pub async fn model_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        overrides: &GenerationOverrides,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome> {
        let cfg = self.config_for(model)?;
        let prompt = self.chat_prompt(&cfg, messages)?;
        let options = self.predict_options(&cfg, overrides, prompt);

        let mut attempt = 0;
        loop {
            let completion = self.loader.predict(&cfg, options.clone(), cancel).await?;
            let text = truncate_at_stop(&completion.text, &options.stop);

            if cfg.functions.is_empty() {
                return Ok(ChatOutcome::Text(text));
            }
            match detect_tool_call(&text) {
                ToolCallDetection::Call { name, arguments } => {
                    return Ok(ChatOutcome::ToolCall { name, arguments });
                }
                ToolCallDetection::Malformed if attempt < MAX_TOOL_REENTRY => {
                    debug!(model, "malformed tool call; re-prompting");
                    attempt += 1;
                }
                _ => return Ok(ChatOutcome::Text(text)),
            }
        }
    }

    /// Streamed chat completion with stop-sequence truncation applied before
    /// chunks reach the handler.
    pub async fn model_chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        overrides: &GenerationOverrides,
        cancel: &CancellationToken,
    ) -> Result<ChatStream> {
        let cfg = self.config_for(model)?;
        let prompt = self.chat_prompt(&cfg, messages)?;
        let options = self.predict_options(&cfg, overrides, prompt);
        let stops = options.stop.clone();
        let stream = self.loader.predict_stream(&cfg, options, cancel).await?;
        Ok(ChatStream::new(stream, stops))
    }

    pub async fn model_completion(
        &self,
        model: &str,
        input: &str,
        overrides: &GenerationOverrides,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let cfg = self.config_for(model)?;
        let prompt = self.completion_prompt(&cfg, input)?;
        let options = self.predict_options(&cfg, overrides, prompt);
        let stop = options.stop.clone();
        let completion = self.loader.predict(&cfg, options, cancel).await?;
        Ok(truncate_at_stop(&completion.text, &stop))
    }

    pub async fn model_completion_stream(
        &self,
        model: &str,
        input: &str,
        overrides: &GenerationOverrides,
        cancel: &CancellationToken,
    ) -> Result<ChatStream> {
        let cfg = self.config_for(model)?;
        let prompt = self.completion_prompt(&cfg, input)?;
        let options = self.predict_options(&cfg, overrides, prompt);
        let stops = options.stop.clone();
        let stream = self.loader.predict_stream(&cfg, options, cancel).await?;
        Ok(ChatStream::new(stream, stops))
    }

    pub async fn model_embedding(
        &self,
        model: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>> {
        let cfg = self.config_for(model)?;
        self.loader.embed(&cfg, text.to_string(), cancel).await
    }

    /// Returns the path of the generated audio file under the audio dir.
    pub async fn model_tts(
        &self,
        backend: Option<&str>,
        model: &str,
        text: &str,
        voice: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let mut cfg = (*self.config_for(model)?).clone();
        if let Some(backend) = backend {
            cfg.backend = backend.to_string();
        }
        let destination = self.opts.audio_path.display().to_string();
        let path = self
            .loader
            .tts(
                &cfg,
                text.to_string(),
                voice.map(str::to_string),
                Some(destination),
                cancel,
            )
            .await?;
        Ok(PathBuf::from(path))
    }

    pub async fn model_transcription(
        &self,
        model: &str,
        file: &Path,
        language: Option<&str>,
        threads: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<TranscriptSegment>> {
        let cfg = self.config_for(model)?;
        self.loader
            .transcribe(
                &cfg,
                file.display().to_string(),
                language.map(str::to_string),
                threads,
                cancel,
            )
            .await
    }

    /// Returns the path of the generated image under the image dir.
    pub async fn model_image(
        &self,
        model: &str,
        prompt: &str,
        width: u32,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let cfg = self.config_for(model)?;
        let options = ImageOptions {
            prompt: prompt.to_string(),
            negative_prompt: None,
            width,
            height,
            seed: cfg.parameters.seed,
            destination: Some(self.opts.image_path.display().to_string()),
        };
        let path = self.loader.generate_image(&cfg, options, cancel).await?;
        Ok(PathBuf::from(path))
    }
}

enum ToolCallDetection {
    Call {
        name: String,
        arguments: serde_json::Value,
    },
    Malformed,
    None,
}

/// A tool call is a JSON object with `name` and `arguments`, optionally
/// wrapped in `<tool_call>` tags.
fn detect_tool_call(text: &str) -> ToolCallDetection {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("<tool_call>")
        .and_then(|rest| rest.strip_suffix("</tool_call>"))
        .map(str::trim)
        .unwrap_or(trimmed);

    if !body.starts_with('{') {
        return ToolCallDetection::None;
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => {
            let name = value.get("name").and_then(|n| n.as_str());
            match name {
                Some(name) => ToolCallDetection::Call {
                    name: name.to_string(),
                    arguments: value
                        .get("arguments")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null),
                },
                None => ToolCallDetection::Malformed,
            }
        }
        Err(_) => ToolCallDetection::Malformed,
    }
}

/// Truncate at the earliest occurrence of any stop string.
fn truncate_at_stop(text: &str, stops: &[String]) -> String {
    let cut = stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min();
    match cut {
        Some(pos) => text[..pos].to_string(),
        None => text.to_string(),
    }
}

/// Incremental stop-sequence filter for streamed chunks.
///
/// Holds back the longest suffix of what has been seen that could still grow
/// into a stop string, so a stop split across chunk boundaries never leaks to
/// the consumer.
pub struct StopFilter {
    stops: Vec<String>,
    buffer: String,
}

impl StopFilter {
    pub fn new(stops: Vec<String>) -> Self {
        let stops = stops.into_iter().filter(|s| !s.is_empty()).collect();
        Self {
            stops,
            buffer: String::new(),
        }
    }

    /// Feed one chunk; returns the text safe to emit and whether a stop
    /// string completed.
    pub fn push(&mut self, chunk: &str) -> (String, bool) {
        if self.stops.is_empty() {
            return (chunk.to_string(), false);
        }
        self.buffer.push_str(chunk);

        if let Some(pos) = self
            .stops
            .iter()
            .filter_map(|s| self.buffer.find(s.as_str()))
            .min()
        {
            let emit = self.buffer[..pos].to_string();
            self.buffer.clear();
            return (emit, true);
        }

        let hold = self.held_back_len();
        let emit_to = self.buffer.len() - hold;
        let emit = self.buffer[..emit_to].to_string();
        self.buffer.drain(..emit_to);
        (emit, false)
    }

    /// Anything still held back once the stream ends cleanly.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    fn held_back_len(&self) -> usize {
        for (i, _) in self.buffer.char_indices() {
            let suffix = &self.buffer[i..];
            if self.stops.iter().any(|s| s.starts_with(suffix)) {
                return self.buffer.len() - i;
            }
        }
        0
    }
}

/// Stream handed to HTTP handlers: loader stream + stop filtering, ending
/// with exactly one terminal event.
pub struct ChatStream {
    inner: Option<BackendStream>,
    filter: StopFilter,
    queued: VecDeque<StreamEvent>,
}

impl ChatStream {
    fn new(inner: BackendStream, stops: Vec<String>) -> Self {
        Self {
            inner: Some(inner),
            filter: StopFilter::new(stops),
            queued: VecDeque::new(),
        }
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.queued.pop_front() {
            return Some(event);
        }
        loop {
            let event = match self.inner.as_mut() {
                Some(stream) => stream.next().await,
                None => return None,
            };
            match event {
                Some(StreamEvent::Chunk(chunk)) => {
                    let (emit, stopped) = self.filter.push(&chunk);
                    if stopped {
                        // Dropping the inner stream cancels generation on the
                        // worker.
                        self.inner = None;
                        let end = StreamEvent::End {
                            finish_reason: Some("stop".into()),
                        };
                        if emit.is_empty() {
                            return Some(end);
                        }
                        self.queued.push_back(end);
                        return Some(StreamEvent::Chunk(emit));
                    }
                    if emit.is_empty() {
                        continue;
                    }
                    return Some(StreamEvent::Chunk(emit));
                }
                Some(StreamEvent::End { finish_reason }) => {
                    self.inner = None;
                    let tail = self.filter.flush();
                    let end = StreamEvent::End { finish_reason };
                    if tail.is_empty() {
                        return Some(end);
                    }
                    self.queued.push_back(end);
                    return Some(StreamEvent::Chunk(tail));
                }
                Some(StreamEvent::Error(message)) => {
                    self.inner = None;
                    return Some(StreamEvent::Error(message));
                }
                None => {
                    self.inner = None;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::fake::FakeWorker;

    #[test]
    fn stop_filter_catches_split_stop_strings() {
        let mut filter = StopFilter::new(vec!["</s>".into()]);

        let (emit, stopped) = filter.push("hello <");
        assert_eq!(emit, "hello ");
        assert!(!stopped);

        let (emit, stopped) = filter.push("/s> world");
        assert_eq!(emit, "");
        assert!(stopped);
    }

    #[test]
    fn stop_filter_releases_false_prefixes() {
        let mut filter = StopFilter::new(vec!["STOP".into()]);

        let (emit, stopped) = filter.push("abcST");
        assert_eq!(emit, "abc");
        assert!(!stopped);

        let (emit, stopped) = filter.push("xyz");
        assert_eq!(emit, "STxyz");
        assert!(!stopped);
        assert_eq!(filter.flush(), "");
    }

    #[test]
    fn stop_filter_without_stops_is_transparent() {
        let mut filter = StopFilter::new(vec![]);
        let (emit, stopped) = filter.push("anything");
        assert_eq!(emit, "anything");
        assert!(!stopped);
    }

    #[test]
    fn truncates_at_earliest_stop() {
        let out = truncate_at_stop("one\ntwo###three", &["###".into(), "\n".into()]);
        assert_eq!(out, "one");
    }

    #[test]
    fn detects_wrapped_tool_calls() {
        let text = r#"<tool_call>{"name": "get_weather", "arguments": {"city": "Oslo"}}</tool_call>"#;
        match detect_tool_call(text) {
            ToolCallDetection::Call { name, arguments } => {
                assert_eq!(name, "get_weather");
                assert_eq!(arguments["city"], "Oslo");
            }
            _ => panic!("expected a tool call"),
        }
    }

    #[test]
    fn plain_text_is_not_a_tool_call() {
        assert!(matches!(
            detect_tool_call("the weather is nice"),
            ToolCallDetection::None
        ));
        assert!(matches!(
            detect_tool_call(r#"{"no_name": true"#),
            ToolCallDetection::Malformed
        ));
    }

    async fn dispatcher_with(worker_addr: &str, yaml: &str) -> (Dispatcher, tempfile::TempDir) {
        let models = tempfile::tempdir().unwrap();
        std::fs::write(models.path().join("m.yaml"), yaml).unwrap();

        let mut opts = AppOptions::default();
        opts.models_path = models.path().to_path_buf();
        opts.external_backends
            .insert("fake".into(), worker_addr.to_string());

        let store = Arc::new(ConfigStore::load(models.path(), &opts).unwrap());
        let loader = Arc::new(ModelLoader::new(opts.clone()));
        (Dispatcher::new(opts, store, loader), models)
    }

    #[tokio::test]
    async fn chat_renders_the_template_and_returns_text() {
        let worker = FakeWorker::spawn().await;
        let yaml = concat!(
            "name: m\n",
            "backend: fake\n",
            "model: m.bin\n",
            "template:\n",
            "  chat: \"[{{ input }}]\"\n",
        );
        let (dispatcher, _dir) = dispatcher_with(worker.addr(), yaml).await;

        let outcome = dispatcher
            .model_chat(
                "m",
                &[ChatMessage {
                    role: "user".into(),
                    content: "hi".into(),
                }],
                &GenerationOverrides::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match outcome {
            ChatOutcome::Text(text) => assert_eq!(text, "echo:[hi]"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn chat_stream_truncates_at_stop() {
        // The fake emits "p-0", "p-1", "p-2", …; stopping on "-2" must cut
        // the stream mid-way.
        let worker = FakeWorker::builder().chunks(5).spawn().await;
        let yaml = concat!(
            "name: m\n",
            "backend: fake\n",
            "model: m.bin\n",
            "template:\n",
            "  chat: \"p\"\n",
        );
        let (dispatcher, _dir) = dispatcher_with(worker.addr(), yaml).await;

        let mut stream = dispatcher
            .model_chat_stream(
                "m",
                &[ChatMessage {
                    role: "user".into(),
                    content: "x".into(),
                }],
                &GenerationOverrides {
                    stop: vec!["-2".into()],
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut text = String::new();
        let mut finish = None;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Chunk(c) => text.push_str(&c),
                StreamEvent::End { finish_reason } => {
                    finish = finish_reason;
                    break;
                }
                StreamEvent::Error(e) => panic!("stream error: {e}"),
            }
        }
        assert_eq!(text, "p-0p-1p");
        assert_eq!(finish.as_deref(), Some("stop"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_model_is_config_not_found() {
        let worker = FakeWorker::spawn().await;
        let (dispatcher, _dir) =
            dispatcher_with(worker.addr(), "name: m\nbackend: fake\nmodel: m.bin\n").await;

        let err = dispatcher
            .model_completion(
                "nope",
                "x",
                &GenerationOverrides::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[tokio::test]
    async fn embedding_flows_through() {
        let worker = FakeWorker::spawn().await;
        let (dispatcher, _dir) =
            dispatcher_with(worker.addr(), "name: m\nbackend: fake\nmodel: m.bin\n").await;

        let vector = dispatcher
            .model_embedding("m", "some text", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(vector.len(), 3);
    }
}
