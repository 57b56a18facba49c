//! Per-model backend configuration.
//!
//! Each servable model is declared by one YAML document in the models
//! directory. Configs are immutable after load and addressed by name.

mod store;

pub use store::ConfigStore;

use serde::{Deserialize, Serialize};

use crate::options::AppOptions;

/// Declarative description of one servable model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Logical model name; defaults to the config file stem.
    #[serde(default)]
    pub name: String,

    /// Backend implementation name, e.g. "llama-cpp", "whisper", "piper".
    #[serde(default)]
    pub backend: String,

    /// Model file reference: a path under the models directory or a URL.
    #[serde(default)]
    pub model: String,

    /// Name of a base config merged underneath this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f16: Option<bool>,

    /// Quantization flag forwarded to the backend, part of the loader key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,

    /// Generation defaults applied when the request does not override them.
    #[serde(default)]
    pub parameters: GenerationDefaults,

    #[serde(default)]
    pub template: TemplateConfig,

    /// Free-form option strings passed to the backend at load time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,

    /// Tool definitions exposed to chat requests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Sampling and decoding defaults for one model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationDefaults {
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

/// Prompt template references. Each value is either the stem of a
/// `<name>.tmpl` file in the models directory or an inline template string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// One tool a chat model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl BackendConfig {
    /// Fill unset fields from the global options and guarantee a legal
    /// generation record.
    pub fn set_defaults(&mut self, opts: &AppOptions) {
        if self.context_size.is_none() {
            self.context_size = Some(opts.context_size);
        }
        if self.threads.is_none() {
            self.threads = Some(opts.threads);
        }
        if self.f16.is_none() {
            self.f16 = Some(opts.f16);
        }

        let p = &mut self.parameters;
        p.temperature.get_or_insert(0.9);
        p.top_k.get_or_insert(40);
        p.top_p.get_or_insert(0.95);
        p.batch.get_or_insert(512);
        p.max_tokens.get_or_insert(512);
    }

    /// Overlay `self` on top of `base`: unset fields inherit, set fields win.
    pub fn merge_over(&self, base: &BackendConfig) -> BackendConfig {
        let mut merged = base.clone();
        merged.name = self.name.clone();
        merged.base = None;

        if !self.backend.is_empty() {
            merged.backend = self.backend.clone();
        }
        if !self.model.is_empty() {
            merged.model = self.model.clone();
        }
        if self.context_size.is_some() {
            merged.context_size = self.context_size;
        }
        if self.threads.is_some() {
            merged.threads = self.threads;
        }
        if self.f16.is_some() {
            merged.f16 = self.f16;
        }
        if self.quantization.is_some() {
            merged.quantization = self.quantization.clone();
        }
        if !self.options.is_empty() {
            merged.options = self.options.clone();
        }
        if !self.functions.is_empty() {
            merged.functions = self.functions.clone();
        }
        if !self.tags.is_empty() {
            merged.tags = self.tags.clone();
        }

        let p = &self.parameters;
        let m = &mut merged.parameters;
        if p.temperature.is_some() {
            m.temperature = p.temperature;
        }
        if p.top_k.is_some() {
            m.top_k = p.top_k;
        }
        if p.top_p.is_some() {
            m.top_p = p.top_p;
        }
        if p.typical_p.is_some() {
            m.typical_p = p.typical_p;
        }
        if p.tfz.is_some() {
            m.tfz = p.tfz;
        }
        if p.frequency_penalty.is_some() {
            m.frequency_penalty = p.frequency_penalty;
        }
        if p.presence_penalty.is_some() {
            m.presence_penalty = p.presence_penalty;
        }
        if p.seed.is_some() {
            m.seed = p.seed;
        }
        if p.batch.is_some() {
            m.batch = p.batch;
        }
        if p.max_tokens.is_some() {
            m.max_tokens = p.max_tokens;
        }
        if !p.stop.is_empty() {
            m.stop = p.stop.clone();
        }
        if p.grammar.is_some() {
            m.grammar = p.grammar.clone();
        }

        let t = &self.template;
        let mt = &mut merged.template;
        if t.chat.is_some() {
            mt.chat = t.chat.clone();
        }
        if t.completion.is_some() {
            mt.completion = t.completion.clone();
        }
        if t.edit.is_some() {
            mt.edit = t.edit.clone();
        }
        if t.function.is_some() {
            mt.function = t.function.clone();
        }

        merged
    }
}
