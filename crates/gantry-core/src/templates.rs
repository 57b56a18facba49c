//! Prompt template rendering.
//!
//! Templates are Jinja text with the variables `input`, `system`, `messages`
//! and `functions`. A template reference is either the stem of a
//! `<stem>.tmpl` file in the models directory or an inline template string.

use std::path::Path;

use minijinja::{context, Environment};
use serde::Serialize;

use crate::error::Result;

/// One chat turn as seen by templates and the dispatch facade.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

pub struct PromptInputs<'a> {
    pub input: &'a str,
    pub system: &'a str,
    pub messages: &'a [ChatMessage],
    pub functions: &'a serde_json::Value,
}

pub fn render(models_path: &Path, reference: &str, inputs: &PromptInputs<'_>) -> Result<String> {
    let file = models_path.join(format!("{reference}.tmpl"));
    let source = if file.is_file() {
        std::fs::read_to_string(&file)?
    } else {
        reference.to_string()
    };

    let mut env = Environment::new();
    env.add_template("prompt", &source)?;
    let rendered = env.get_template("prompt")?.render(context! {
        input => inputs.input,
        system => inputs.system,
        messages => inputs.messages,
        functions => inputs.functions,
    })?;
    Ok(rendered)
}

/// Used when a chat config declares no template.
pub fn default_chat_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(&message.role);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("assistant: ");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages() -> Vec<ChatMessage> {
        vec![
            ChatMessage {
                role: "system".into(),
                content: "be terse".into(),
            },
            ChatMessage {
                role: "user".into(),
                content: "hi".into(),
            },
        ]
    }

    #[test]
    fn inline_template_renders_messages() {
        let tmp = tempfile::tempdir().unwrap();
        let rendered = render(
            tmp.path(),
            "{% for m in messages %}<|{{ m.role }}|>{{ m.content }}{% endfor %}",
            &PromptInputs {
                input: "",
                system: "",
                messages: &messages(),
                functions: &serde_json::Value::Null,
            },
        )
        .unwrap();
        assert_eq!(rendered, "<|system|>be terse<|user|>hi");
    }

    #[test]
    fn file_reference_wins_over_inline() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("alpaca.tmpl"), "### Input: {{ input }}").unwrap();

        let rendered = render(
            tmp.path(),
            "alpaca",
            &PromptInputs {
                input: "count to three",
                system: "",
                messages: &[],
                functions: &serde_json::Value::Null,
            },
        )
        .unwrap();
        assert_eq!(rendered, "### Input: count to three");
    }

    #[test]
    fn default_prompt_ends_with_assistant_cue() {
        let prompt = default_chat_prompt(&messages());
        assert!(prompt.starts_with("system: be terse\n"));
        assert!(prompt.ends_with("assistant: "));
    }
}
