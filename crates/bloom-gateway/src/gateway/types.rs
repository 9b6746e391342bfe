//! Core Gateway Types
//!
//! Provider-agnostic data types shared across the gateway: chat messages,
//! per-call options, the attempt/outcome records that make up the call log,
//! and the unified [`GatewayError`] taxonomy.
//!
//! The key shape here is [`CallResult`]: the gateway's public boundary never
//! raises. Every call — success, retries-exhausted, tunnel failure, schema
//! mismatch — resolves to a `CallResult` whose `error` field carries the
//! failure kind and whose other fields carry best-effort partial data (the
//! raw response text survives a structured-parse failure, for example).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Chat Messages
// ============================================================================

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single chat message in the provider-agnostic format.
///
/// Serializes directly to the OpenAI-compatible wire shape
/// (`{"role": "...", "content": "..."}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

// ============================================================================
// Call Options
// ============================================================================

/// Per-call options accepted by [`Gateway::call`](super::executor::Gateway::call).
///
/// Builder-style construction:
///
/// ```rust
/// use bloom_gateway::gateway::types::CallOptions;
///
/// let options = CallOptions::new()
///     .with_temperature(0.7)
///     .with_max_tokens(512)
///     .with_max_retries(2)
///     .with_cache(true);
/// ```
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Sampling temperature forwarded to the provider.
    pub temperature: Option<f32>,

    /// Completion token cap forwarded to the provider.
    pub max_tokens: Option<u32>,

    /// Maximum number of retries after the first attempt. A call with
    /// `max_retries = k` performs at most `k + 1` network attempts against
    /// the primary model before considering the fallback plan.
    pub max_retries: u32,

    /// Consult the in-process response cache before any network work.
    pub use_cache: bool,

    /// JSON Schema the response must validate against. When set, the raw
    /// text is fence-stripped, parsed as JSON, and validated; a mismatch is
    /// a [`GatewayError::StructuredParse`] and is never retried.
    pub response_schema: Option<serde_json::Value>,

    /// Deadline for the whole call, spanning every retry and the fallback
    /// plan. Expiry mid-retry stops the loop with `DeadlineExceeded`.
    pub timeout: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            temperature: None,
            max_tokens: None,
            max_retries: 3,
            use_cache: false,
            response_schema: None,
            timeout: Duration::from_secs(180),
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_response_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ============================================================================
// Attempts & Call Log
// ============================================================================

/// Outcome of a single network attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AttemptOutcome {
    Success,
    /// The attempt failed but the executor may retry (transient error).
    RetryableFailure(String),
    /// The attempt failed terminally for this plan (no further retries).
    FatalFailure(String),
}

/// Record of one retry iteration, kept only in the returned call log.
#[derive(Debug, Clone, Serialize)]
pub struct CallAttempt {
    /// The model identifier this attempt was issued against (the fallback
    /// model once the executor has switched plans).
    pub model: String,
    /// 1-based attempt number within its plan.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
}

/// Audit log embedded in every [`CallResult`].
///
/// Downstream evaluation code persists this for judge auditing; the gateway
/// itself never stores it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallLog {
    /// The final resolved model identifier (post-fallback, post-normalization).
    pub model: String,
    /// The full message list that was sent.
    pub messages: Vec<ChatMessage>,
    /// Raw provider response body of the successful attempt, if any.
    pub raw_response: Option<serde_json::Value>,
    /// Auxiliary reasoning content extracted from the response, if the
    /// provider emitted any (`reasoning_content` in the wire format).
    pub reasoning: Option<String>,
    /// One record per network attempt, in order.
    pub attempts: Vec<CallAttempt>,
    /// Whether the response was served from the in-process cache.
    pub cache_hit: bool,
}

// ============================================================================
// Call Result
// ============================================================================

/// The uniform result shape returned by the gateway for every call.
///
/// `error` is `None` exactly when the call fully succeeded (including schema
/// validation, if requested). On failure the other fields still carry
/// whatever was salvaged: `response_text` holds the raw text even when
/// structured parsing failed.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub response_text: Option<String>,
    pub structured_response: Option<serde_json::Value>,
    pub error: Option<GatewayError>,
    pub log: CallLog,
}

impl CallResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into a conventional `Result` for callers that prefer `?`.
    pub fn into_result(self) -> Result<Self, GatewayError> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(self),
        }
    }
}

// ============================================================================
// Error Taxonomy
// ============================================================================

/// Unified error type for the gateway.
///
/// Classification drives policy in the executor:
/// - `TransientProvider` → retried with exponential backoff
/// - `Overloaded` → immediate one-time switch to the fallback plan
/// - `TunnelEstablishment` / `AdapterLoad` → fatal for the call; the
///   respective manager already performed its own bounded retries
/// - `StructuredParse` → never retried (the response arrived; it just
///   failed validation)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("tunnel establishment failed: {0}")]
    TunnelEstablishment(String),

    #[error("adapter load failed for '{name}': {reason}")]
    AdapterLoad { name: String, reason: String },

    #[error("transient provider error: {0}")]
    TransientProvider(String),

    #[error("provider overloaded: {0}")]
    Overloaded(String),

    #[error("provider error, retries exhausted: {0}")]
    FatalProvider(String),

    #[error("structured response failed validation: {0}")]
    StructuredParse(String),

    #[error("call deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Whether the executor's backoff loop may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::TransientProvider(_) | GatewayError::Overloaded(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::user("hello");
        assert_eq!(msg.role, ChatRole::User);
        assert_eq!(msg.content, "hello");

        assert_eq!(ChatMessage::system("s").role, ChatRole::System);
        assert_eq!(ChatMessage::assistant("a").role, ChatRole::Assistant);
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = ChatMessage::assistant("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn test_options_builder() {
        let options = CallOptions::new()
            .with_temperature(0.2)
            .with_max_tokens(64)
            .with_max_retries(5)
            .with_cache(true)
            .with_timeout(Duration::from_secs(30));

        assert_eq!(options.temperature, Some(0.2));
        assert_eq!(options.max_tokens, Some(64));
        assert_eq!(options.max_retries, 5);
        assert!(options.use_cache);
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert!(options.response_schema.is_none());
    }

    #[test]
    fn test_options_defaults() {
        let options = CallOptions::default();
        assert_eq!(options.max_retries, 3);
        assert!(!options.use_cache);
        assert!(options.temperature.is_none());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::TransientProvider("503".into()).is_retryable());
        assert!(GatewayError::Overloaded("529".into()).is_retryable());
        assert!(!GatewayError::FatalProvider("401".into()).is_retryable());
        assert!(!GatewayError::StructuredParse("bad json".into()).is_retryable());
        assert!(!GatewayError::TunnelEstablishment("no ssh".into()).is_retryable());
        assert!(!GatewayError::AdapterLoad {
            name: "a".into(),
            reason: "500".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_result_into_result() {
        let ok = CallResult {
            response_text: Some("text".into()),
            structured_response: None,
            error: None,
            log: CallLog::default(),
        };
        assert!(ok.is_success());
        assert!(ok.into_result().is_ok());

        let failed = CallResult {
            response_text: None,
            structured_response: None,
            error: Some(GatewayError::FatalProvider("down".into())),
            log: CallLog::default(),
        };
        assert!(!failed.is_success());
        assert!(matches!(
            failed.into_result(),
            Err(GatewayError::FatalProvider(_))
        ));
    }
}
