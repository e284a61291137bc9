//! OpenAI-compatible request types and chunk inspection helpers.
//!
//! Upstream payloads are handled as `serde_json::Value` so unknown fields
//! from any provider pass through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The body of `POST /v1/chat/completions`.
///
/// Only the fields llmgate acts on are typed. Everything else (sampling
/// parameters, tools, response formats) is kept in `extra` and forwarded
/// as sent.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One chat turn. `content` is a string or a list of content parts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StreamOptions {
    /// Ask for a trailing chunk carrying `usage`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_usage: Option<bool>,
}

impl ChatCompletionRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream == Some(true)
    }

    /// Check the request is worth sending upstream.
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("'model' must not be empty".to_string());
        }
        if self.messages.is_empty() {
            return Err("'messages' must contain at least one message".to_string());
        }
        Ok(())
    }

    /// Turn on the usage trailer for a streamed call. An explicit
    /// `include_usage` from the client wins.
    pub fn request_usage_trailer(&mut self) {
        self.stream_options
            .get_or_insert_with(StreamOptions::default)
            .include_usage
            .get_or_insert(true);
    }
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Extract token usage from a completion or a final stream chunk.
///
/// Returns `None` if usage is missing, null, or incomplete.
pub fn extract_usage(payload: &Value) -> Option<Usage> {
    let usage = payload.get("usage")?;
    Some(Usage {
        prompt_tokens: usage.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: usage.get("completion_tokens")?.as_u64()? as u32,
    })
}

/// Whether a stream chunk carries generated content.
pub fn chunk_has_content(chunk: &Value) -> bool {
    let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
        return false;
    };
    choices.iter().any(|choice| {
        choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty())
    })
}
