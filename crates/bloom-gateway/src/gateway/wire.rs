//! OpenAI-Compatible Wire Types
//!
//! Hand-modelled request/response bodies for the three wire operations the
//! gateway performs: chat completions, model listing, and LoRA adapter
//! loading. The gateway talks to arbitrary base URLs (tunneled vLLM,
//! autoscaled vLLM, hosted providers) and needs the raw response JSON for
//! the call log, so requests go through `reqwest` + `serde` directly rather
//! than a provider SDK.

use serde::{Deserialize, Serialize};

use super::types::ChatMessage;

// ============================================================================
// Chat Completions
// ============================================================================

/// `POST {base}/chat/completions` request body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// `POST {base}/chat/completions` response body (non-streaming).
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// The assistant message of a choice. `reasoning_content` is the auxiliary
/// reasoning channel emitted by reasoning-capable servers; it is captured
/// into the call log, never merged into the response text.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
}

impl ChatCompletionResponse {
    /// Text of the first choice, if the provider returned one.
    pub fn primary_text(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.message.content.as_deref())
    }

    /// Reasoning content of the first choice, if any.
    pub fn reasoning(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.reasoning_content.as_deref())
    }
}

// ============================================================================
// Model Listing & Adapter Loading
// ============================================================================

/// `GET {base}/models` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelList {
    #[serde(default)]
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub id: String,
}

impl ModelList {
    pub fn contains(&self, name: &str) -> bool {
        self.data.iter().any(|entry| entry.id == name)
    }
}

/// `POST {base}/load_lora_adapter` request body (vLLM LoRA hot-load API).
#[derive(Debug, Clone, Serialize)]
pub struct LoadAdapterRequest {
    pub lora_name: String,
    pub lora_path: String,
}

// ============================================================================
// Tests
// ============================================================================
