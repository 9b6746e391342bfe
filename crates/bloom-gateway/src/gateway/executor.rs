//! Call Executor — Retry, Fallback, and Structured-Response Policy
//!
//! [`Gateway`] is the single entry point consumed by evaluation and judging
//! code. One instance is constructed per process and owns the tunnel
//! manager, the adapter manager, the HTTP client, and the response cache —
//! no module-level globals, so a fresh `Gateway` per test carries no shared
//! state.
//!
//! ## Retry policy as data
//!
//! A call is an ordered list of [`AttemptPlan`]s evaluated by one loop:
//! the primary plan with `max_retries + 1` attempts and exponential
//! backoff, then an optional fallback plan with its own bounded budget.
//! An overload-class provider error short-circuits to the fallback plan
//! immediately, without consuming a retry slot. The policy lives in the
//! plan list, not in nested control flow.
//!
//! ## The infallible boundary
//!
//! [`Gateway::call`] returns [`CallResult`], never `Err` and never a panic:
//! every failure mode — tunnel, adapter, retries exhausted, deadline,
//! schema mismatch — resolves to `CallResult { error: Some(..) }` with
//! best-effort partial data and the full attempt log.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::adapter::AdapterManager;
use super::config::{GatewayConfig, AUTOSCALER_KEY_ENV};
use super::router::{self, BackendKind};
use super::tunnel::TunnelManager;
use super::types::{
    AttemptOutcome, CallAttempt, CallLog, CallOptions, CallResult, ChatMessage, GatewayError,
};
use super::wire::{ChatCompletionRequest, ChatCompletionResponse};

// ============================================================================
// Internal shapes
// ============================================================================

/// A backend ready to receive completion requests: resolved, tunneled, and
/// adapter-loaded as needed.
#[derive(Debug, Clone)]
struct PreparedBackend {
    /// Wire identifier (post-normalization).
    model: String,
    base_url: String,
    api_key: Option<String>,
}

/// One entry in the ordered retry policy.
#[derive(Debug, Clone)]
struct AttemptPlan {
    /// Caller-facing model identifier (pre-normalization).
    model: String,
    max_attempts: u32,
}

/// Successful wire response, pre-parsed.
#[derive(Debug, Clone)]
struct WireSuccess {
    text: String,
    reasoning: Option<String>,
    raw: serde_json::Value,
}

#[derive(Debug, Clone)]
struct CachedResponse {
    text: String,
    reasoning: Option<String>,
    raw: serde_json::Value,
}

// ============================================================================
// Gateway
// ============================================================================

/// The inference gateway. Construct once per process.
///
/// ```rust,ignore
/// use bloom_gateway::gateway::{Gateway, GatewayConfig, CallOptions, ChatMessage};
///
/// let gateway = Gateway::new(GatewayConfig::from_env()?);
/// let result = gateway
///     .call(
///         &[ChatMessage::user("rate this transcript")],
///         "acme/character-v3",
///         CallOptions::new().with_max_retries(2),
///     )
///     .await;
/// if let Some(err) = &result.error {
///     tracing::warn!("judge call failed: {err}");
/// }
/// ```
pub struct Gateway {
    config: GatewayConfig,
    tunnel: TunnelManager,
    adapters: AdapterManager,
    http: reqwest::Client,
    cache: Mutex<LruCache<u64, CachedResponse>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").field("config", &self.config).finish()
    }
}

impl Gateway {
    /// Create a gateway with the default SSH tunnel spawner.
    pub fn new(config: GatewayConfig) -> Self {
        let tunnel = TunnelManager::new(config.local_port_base);
        Self::with_tunnel_manager(config, tunnel)
    }

    /// Create a gateway around a pre-built tunnel manager (tests substitute
    /// a spawner here).
    pub fn with_tunnel_manager(config: GatewayConfig, tunnel: TunnelManager) -> Self {
        let capacity =
            NonZeroUsize::new(config.cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            tunnel,
            adapters: AdapterManager::new(),
            http: reqwest::Client::new(),
            cache: Mutex::new(LruCache::new(capacity)),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Tear down every live tunnel. Call once at process exit.
    pub async fn shutdown(&self) {
        self.tunnel.shutdown().await;
    }

    // ========================================================================
    // Public call boundary
    // ========================================================================

    /// Issue a chat-completion call. Never returns `Err` or panics; see the
    /// module docs for the failure contract.
    pub async fn call(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: CallOptions,
    ) -> CallResult {
        let mut log = CallLog {
            model: model.to_string(),
            messages: messages.to_vec(),
            ..CallLog::default()
        };

        if messages.is_empty() {
            return failure(
                log,
                None,
                GatewayError::Config("call requires at least one message".to_string()),
            );
        }

        let key = cache_key(model, messages, &options);
        if options.use_cache {
            if let Some(cached) = self.cache.lock().await.get(&key).cloned() {
                tracing::debug!("Gateway: cache hit for model '{model}'");
                log.cache_hit = true;
                log.raw_response = Some(cached.raw.clone());
                log.reasoning = cached.reasoning.clone();
                return finish(log, cached.text, &options);
            }
        }

        let deadline = Instant::now() + options.timeout;

        let success = match self
            .execute_plans(model, messages, &options, deadline, &mut log)
            .await
        {
            Ok(success) => success,
            Err(e) => return failure(log, None, e),
        };

        log.raw_response = Some(success.raw.clone());
        log.reasoning = success.reasoning.clone();

        if options.use_cache {
            self.cache.lock().await.put(
                key,
                CachedResponse {
                    text: success.text.clone(),
                    reasoning: success.reasoning,
                    raw: success.raw,
                },
            );
        }

        finish(log, success.text, &options)
    }

    // ========================================================================
    // Plan evaluation
    // ========================================================================

    async fn execute_plans(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
        deadline: Instant,
        log: &mut CallLog,
    ) -> Result<WireSuccess, GatewayError> {
        let mut plans = vec![AttemptPlan {
            model: model.to_string(),
            max_attempts: options.max_retries + 1,
        }];
        if let Some(fallback) = self.config.fallback_for(model) {
            plans.push(AttemptPlan {
                model: fallback.to_string(),
                max_attempts: self.config.fallback_attempts.max(1),
            });
        }

        let mut last_error =
            GatewayError::FatalProvider("no attempts were performed".to_string());

        'plans: for (plan_index, plan) in plans.iter().enumerate() {
            let backend = match self.prepare_backend(&plan.model).await {
                Ok(backend) => backend,
                Err(e) => {
                    // Resource setup failed for this plan; the managers
                    // already did their own bounded retries.
                    if plan_index + 1 < plans.len() {
                        tracing::warn!(
                            "Gateway: backend preparation failed for '{}', trying fallback: {e}",
                            plan.model
                        );
                        last_error = e;
                        continue 'plans;
                    }
                    return Err(e);
                }
            };
            log.model = backend.model.clone();

            for attempt in 1..=plan.max_attempts {
                if attempt > 1 {
                    self.backoff(attempt, deadline).await?;
                }

                match self
                    .send_completion(&backend, messages, options, deadline)
                    .await
                {
                    Ok(success) => {
                        log.attempts.push(CallAttempt {
                            model: backend.model.clone(),
                            attempt,
                            outcome: AttemptOutcome::Success,
                        });
                        return Ok(success);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Gateway: attempt {attempt}/{} against '{}' failed: {e}",
                            plan.max_attempts,
                            backend.model,
                        );
                        log.attempts.push(CallAttempt {
                            model: backend.model.clone(),
                            attempt,
                            outcome: if e.is_retryable() {
                                AttemptOutcome::RetryableFailure(e.to_string())
                            } else {
                                AttemptOutcome::FatalFailure(e.to_string())
                            },
                        });

                        // Overload: switch to the fallback plan right away,
                        // no backoff, no retry slot consumed.
                        if matches!(e, GatewayError::Overloaded(_))
                            && plan_index + 1 < plans.len()
                        {
                            tracing::info!(
                                "Gateway: provider overloaded, switching '{}' -> '{}' immediately",
                                plan.model,
                                plans[plan_index + 1].model,
                            );
                            last_error = e;
                            continue 'plans;
                        }

                        if !e.is_retryable() {
                            return Err(e);
                        }
                        last_error = e;
                    }
                }
            }
        }

        // Every plan exhausted its budget on transient errors. When the
        // deadline ran out along the way, report that rather than generic
        // exhaustion.
        if deadline.saturating_duration_since(Instant::now()).is_zero() {
            return Err(GatewayError::DeadlineExceeded(format!(
                "deadline expired during retries: {last_error}"
            )));
        }
        Err(GatewayError::FatalProvider(format!(
            "retries exhausted: {last_error}"
        )))
    }

    /// Sleep the exponential-backoff delay before `attempt` (2-based), with
    /// jitter, unless the deadline would expire first.
    async fn backoff(&self, attempt: u32, deadline: Instant) -> Result<(), GatewayError> {
        let exponent = (attempt - 2).min(16);
        let base_delay = self.config.retry_base_delay_ms * 2_u64.pow(exponent);
        let jitter = rand::random::<u64>() % (base_delay / 2 + 1);
        let delay = std::time::Duration::from_millis(base_delay + jitter);

        let remaining = deadline.saturating_duration_since(Instant::now());
        if delay >= remaining {
            return Err(GatewayError::DeadlineExceeded(format!(
                "deadline expired before retry backoff of {delay:?}"
            )));
        }
        tokio::time::sleep(delay).await;
        Ok(())
    }

    // ========================================================================
    // Backend preparation
    // ========================================================================

    /// Resolve a model and perform its tunnel/adapter setup.
    async fn prepare_backend(&self, model: &str) -> Result<PreparedBackend, GatewayError> {
        let descriptor = router::resolve(model, &self.config);
        tracing::debug!("Gateway: resolved '{model}' -> {descriptor:?}");

        match descriptor.kind {
            BackendKind::RemoteAdapterServer => {
                let (base_url, api_key) = if descriptor.requires_tunnel {
                    let remote_port = descriptor
                        .remote_port
                        .unwrap_or(self.config.remote_port_default);
                    let local_port = self
                        .tunnel
                        .acquire(&self.config.tunnel_host, remote_port)
                        .await?;
                    (format!("http://127.0.0.1:{local_port}/v1"), None)
                } else {
                    let base_url = descriptor
                        .base_url
                        .clone()
                        .unwrap_or_else(|| self.config.autoscaler_base_url.clone());
                    let key = self.config.api_key(AUTOSCALER_KEY_ENV).map(str::to_string);
                    (base_url, key)
                };

                self.adapters
                    .ensure_loaded(&descriptor.model, &base_url, api_key.as_deref())
                    .await?;

                Ok(PreparedBackend {
                    model: descriptor.model,
                    base_url,
                    api_key,
                })
            }
            BackendKind::HostedProvider(provider) => {
                let api_key = self
                    .config
                    .api_key(provider.api_key_env())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        GatewayError::Config(format!(
                            "{} is not configured (required for {model})",
                            provider.api_key_env()
                        ))
                    })?;
                let base_url = descriptor
                    .base_url
                    .clone()
                    .unwrap_or_else(|| provider.base_url().to_string());
                Ok(PreparedBackend {
                    model: descriptor.model,
                    base_url,
                    api_key: Some(api_key),
                })
            }
        }
    }

    // ========================================================================
    // Wire call
    // ========================================================================

    async fn send_completion(
        &self,
        backend: &PreparedBackend,
        messages: &[ChatMessage],
        options: &CallOptions,
        deadline: Instant,
    ) -> Result<WireSuccess, GatewayError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(GatewayError::DeadlineExceeded(
                "deadline expired before the request was sent".to_string(),
            ));
        }
        let timeout = remaining.min(self.config.request_timeout);

        let body = ChatCompletionRequest {
            model: backend.model.clone(),
            messages: messages.to_vec(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let mut request = self
            .http
            .post(format!("{}/chat/completions", backend.base_url))
            .timeout(timeout)
            .json(&body);
        if let Some(key) = &backend.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::TransientProvider(format!("request timed out: {e}"))
            } else {
                GatewayError::TransientProvider(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        let raw_text = response
            .text()
            .await
            .map_err(|e| GatewayError::TransientProvider(format!("body read failed: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &raw_text));
        }

        let raw: serde_json::Value = serde_json::from_str(&raw_text).map_err(|e| {
            GatewayError::TransientProvider(format!("response was not JSON: {e}"))
        })?;
        let parsed: ChatCompletionResponse =
            serde_json::from_value(raw.clone()).map_err(|e| {
                GatewayError::TransientProvider(format!("response shape unexpected: {e}"))
            })?;

        let text = parsed
            .primary_text()
            .map(str::to_string)
            .ok_or_else(|| {
                GatewayError::TransientProvider("response contained no choices".to_string())
            })?;

        Ok(WireSuccess {
            text,
            reasoning: parsed.reasoning().map(str::to_string),
            raw,
        })
    }
}

// ============================================================================
// Classification & structured parsing
// ============================================================================

/// Map a non-success HTTP response onto the error taxonomy.
///
/// The overload class (HTTP 529 or an "overloaded" body, as Anthropic-style
/// backends emit) gets its own variant because it drives the immediate
/// fallback switch rather than the backoff loop.
fn classify_status(status: u16, body: &str) -> GatewayError {
    let lowered = body.to_ascii_lowercase();
    if status == 529 || lowered.contains("overloaded") {
        return GatewayError::Overloaded(format!("HTTP {status}: {body}"));
    }
    match status {
        429 => GatewayError::TransientProvider(format!("rate limited (HTTP 429): {body}")),
        500 | 502 | 503 | 504 => {
            GatewayError::TransientProvider(format!("server error (HTTP {status}): {body}"))
        }
        _ => GatewayError::FatalProvider(format!("HTTP {status}: {body}")),
    }
}

/// Strip a markdown code-fence wrapper (```/```json) from model output.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

/// Parse and schema-validate a structured response. Failures are
/// [`GatewayError::StructuredParse`] and are never retried — the response
/// arrived; retrying cannot fix malformed JSON for this call.
fn parse_structured(
    text: &str,
    schema: &serde_json::Value,
) -> Result<serde_json::Value, GatewayError> {
    let stripped = strip_code_fences(text);
    let value: serde_json::Value = serde_json::from_str(stripped)
        .map_err(|e| GatewayError::StructuredParse(format!("invalid JSON: {e}")))?;

    let validator = jsonschema::validator_for(schema)
        .map_err(|e| GatewayError::StructuredParse(format!("invalid schema: {e}")))?;
    if let Err(e) = validator.validate(&value) {
        return Err(GatewayError::StructuredParse(format!(
            "schema validation failed: {e}"
        )));
    }
    Ok(value)
}

/// Assemble the final result from a successful wire response, applying the
/// structured-response contract.
fn finish(log: CallLog, text: String, options: &CallOptions) -> CallResult {
    match &options.response_schema {
        None => CallResult {
            response_text: Some(text),
            structured_response: None,
            error: None,
            log,
        },
        Some(schema) => match parse_structured(&text, schema) {
            Ok(value) => CallResult {
                response_text: Some(text),
                structured_response: Some(value),
                error: None,
                log,
            },
            Err(e) => CallResult {
                response_text: Some(text),
                structured_response: None,
                error: Some(e),
                log,
            },
        },
    }
}

fn failure(log: CallLog, text: Option<String>, error: GatewayError) -> CallResult {
    CallResult {
        response_text: text,
        structured_response: None,
        error: Some(error),
        log,
    }
}

fn cache_key(model: &str, messages: &[ChatMessage], options: &CallOptions) -> u64 {
    let mut hasher = DefaultHasher::new();
    model.hash(&mut hasher);
    for message in messages {
        message.content.hash(&mut hasher);
        (message.role as u8).hash(&mut hasher);
    }
    options.temperature.map(f32::to_bits).hash(&mut hasher);
    options.max_tokens.hash(&mut hasher);
    hasher.finish()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_overload() {
        assert!(matches!(
            classify_status(529, "{\"error\":\"Overloaded\"}"),
            GatewayError::Overloaded(_)
        ));
        assert!(matches!(
            classify_status(503, "overloaded_error: try later"),
            GatewayError::Overloaded(_)
        ));
    }

    #[test]
    fn test_classify_transient() {
        for status in [429, 500, 502, 503, 504] {
            assert!(
                matches!(
                    classify_status(status, "boom"),
                    GatewayError::TransientProvider(_)
                ),
                "HTTP {status} should be transient"
            );
        }
    }

    #[test]
    fn test_classify_fatal() {
        for status in [400, 401, 403, 404] {
            assert!(
                matches!(classify_status(status, "no"), GatewayError::FatalProvider(_)),
                "HTTP {status} should be fatal"
            );
        }
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  ```json\n[1,2]\n```  "), "[1,2]");
    }

    #[test]
    fn test_parse_structured_valid() {
        let schema = json!({
            "type": "object",
            "properties": {"score": {"type": "number"}},
            "required": ["score"]
        });
        let value = parse_structured("```json\n{\"score\": 7.5}\n```", &schema).unwrap();
        assert_eq!(value["score"], 7.5);
    }

    #[test]
    fn test_parse_structured_invalid_json() {
        let schema = json!({"type": "object"});
        let err = parse_structured("```json\nnot json at all\n```", &schema).unwrap_err();
        assert!(matches!(err, GatewayError::StructuredParse(_)));
    }

    #[test]
    fn test_parse_structured_schema_mismatch() {
        let schema = json!({
            "type": "object",
            "properties": {"score": {"type": "number"}},
            "required": ["score"]
        });
        let err = parse_structured("{\"grade\": \"A\"}", &schema).unwrap_err();
        assert!(matches!(err, GatewayError::StructuredParse(_)));
    }

    #[test]
    fn test_finish_keeps_raw_text_on_parse_error() {
        let options =
            CallOptions::new().with_response_schema(json!({"type": "object"}));
        let result = finish(CallLog::default(), "not json".to_string(), &options);

        assert_eq!(result.response_text.as_deref(), Some("not json"));
        assert!(result.structured_response.is_none());
        assert!(matches!(
            result.error,
            Some(GatewayError::StructuredParse(_))
        ));
    }

    #[test]
    fn test_cache_key_sensitivity() {
        let messages = vec![ChatMessage::user("hi")];
        let options = CallOptions::new().with_temperature(0.5);

        let base = cache_key("m", &messages, &options);
        assert_eq!(base, cache_key("m", &messages, &options));
        assert_ne!(base, cache_key("other", &messages, &options));
        assert_ne!(
            base,
            cache_key("m", &[ChatMessage::user("bye")], &options)
        );
        assert_ne!(
            base,
            cache_key("m", &messages, &CallOptions::new().with_temperature(0.9))
        );
    }

    #[tokio::test]
    async fn test_empty_messages_rejected_without_network() {
        let gateway = Gateway::new(GatewayConfig::default());
        let result = gateway
            .call(&[], "openai/gpt-4o", CallOptions::new())
            .await;
        assert!(matches!(result.error, Some(GatewayError::Config(_))));
        assert!(result.log.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_hosted_call_without_key_is_config_error() {
        // Keys live in the config; the default carries none.
        let gateway = Gateway::new(GatewayConfig::default());
        let result = gateway
            .call(
                &[ChatMessage::user("hi")],
                "together/llama-3-70b",
                CallOptions::new(),
            )
            .await;
        assert!(matches!(result.error, Some(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn test_hosted_key_resolved_from_config() {
        let gateway = Gateway::new(
            GatewayConfig::default().with_api_key("TOGETHER_API_KEY", "tk-test"),
        );
        let backend = gateway
            .prepare_backend("together/llama-3-70b")
            .await
            .unwrap();
        assert_eq!(backend.api_key.as_deref(), Some("tk-test"));
        assert_eq!(backend.model, "llama-3-70b");
    }

    #[test]
    fn test_gateway_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Gateway>();
    }
}
