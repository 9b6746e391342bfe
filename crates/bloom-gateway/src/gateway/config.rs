//! Gateway Configuration
//!
//! One [`GatewayConfig`] is built per process (env + builder overrides) and
//! handed to [`Gateway::new`](super::executor::Gateway::new). API keys are
//! resolved here too: nothing in the gateway reads the environment after
//! construction, so tests can build fully-specified configs without touching
//! process globals.

use std::collections::HashMap;
use std::time::Duration;

use super::router::Provider;
use super::types::GatewayError;

/// Environment variable selecting the remote-autoscaler path for
/// adapter-backed models (bool-like: `1`, `true`, `yes`, `on`).
pub const USE_AUTOSCALER_ENV: &str = "VLLM_BACKEND_USE_RUNPOD";

/// Environment variable holding the autoscaler API key.
pub const AUTOSCALER_KEY_ENV: &str = "RUNPOD_API_KEY";

/// Default SSH host alias for the tunneled inference box.
const DEFAULT_TUNNEL_HOST: &str = "inference-box";

/// Default base URL of the remote autoscaled vLLM endpoint.
const DEFAULT_AUTOSCALER_BASE_URL: &str = "https://api.runpod.ai/v2/vllm-bloom/openai/v1";

/// Gateway-wide configuration.
///
/// ```rust
/// use bloom_gateway::gateway::config::GatewayConfig;
///
/// let config = GatewayConfig::new()
///     .with_tunnel_host("eval-box")
///     .with_fallback("anthropic", "openrouter/anthropic/claude-3-5-sonnet");
/// ```
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Route adapter-backed models to the remote autoscaler instead of the
    /// SSH tunnel. Read from [`USE_AUTOSCALER_ENV`] by [`GatewayConfig::from_env`].
    pub use_remote_autoscaler: bool,

    /// Base URL of the autoscaled vLLM endpoint (includes `/v1`-equivalent
    /// path). Authenticated with `RUNPOD_API_KEY`.
    pub autoscaler_base_url: String,

    /// SSH host alias of the tunneled inference server. The alias carries
    /// its own authentication context via the user's SSH config.
    pub tunnel_host: String,

    /// Remote vLLM port for adapter-backed models by default.
    pub remote_port_default: u16,

    /// Remote vLLM port selected when the model name contains
    /// [`alt_port_marker`](Self::alt_port_marker).
    pub remote_port_alt: u16,

    /// Substring of the model name that selects the alternate remote port.
    pub alt_port_marker: String,

    /// First local port tried when allocating a tunnel listener.
    pub local_port_base: u16,

    /// Fallback model per model family (the identifier segment before the
    /// first `/`). The key `"*"` matches any family without its own entry.
    pub fallbacks: HashMap<String, String>,

    /// Attempt budget for the fallback plan once the executor switches to it.
    pub fallback_attempts: u32,

    /// Per-attempt network timeout for completion requests.
    pub request_timeout: Duration,

    /// Base delay for exponential backoff between retries.
    /// Actual delay = `retry_base_delay_ms × 2^(attempt-1) + jitter`.
    pub retry_base_delay_ms: u64,

    /// Capacity of the in-process response cache (entries).
    pub cache_capacity: usize,

    /// API keys by environment-variable name, resolved once at construction
    /// ([`GatewayConfig::from_env`] or [`GatewayConfig::with_api_key`]).
    pub api_keys: HashMap<String, String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            use_remote_autoscaler: false,
            autoscaler_base_url: DEFAULT_AUTOSCALER_BASE_URL.to_string(),
            tunnel_host: DEFAULT_TUNNEL_HOST.to_string(),
            remote_port_default: 8000,
            remote_port_alt: 8001,
            alt_port_marker: "qwen".to_string(),
            local_port_base: 18000,
            fallbacks: HashMap::new(),
            fallback_attempts: 1,
            request_timeout: Duration::from_secs(120),
            retry_base_delay_ms: 1000,
            cache_capacity: 256,
            api_keys: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from the environment. Unset variables keep defaults;
    /// a malformed bool value is a [`GatewayError::Config`].
    ///
    /// Provider and autoscaler API keys are captured here; the gateway
    /// never consults the environment again after this returns.
    pub fn from_env() -> Result<Self, GatewayError> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(USE_AUTOSCALER_ENV) {
            config.use_remote_autoscaler = parse_bool(&raw).ok_or_else(|| {
                GatewayError::Config(format!(
                    "{USE_AUTOSCALER_ENV} must be bool-like, got '{raw}'"
                ))
            })?;
        }
        let key_envs = Provider::ALL
            .iter()
            .map(|p| p.api_key_env())
            .chain([AUTOSCALER_KEY_ENV]);
        for env in key_envs {
            if let Ok(value) = std::env::var(env) {
                config.api_keys.insert(env.to_string(), value);
            }
        }
        Ok(config)
    }

    pub fn with_remote_autoscaler(mut self, enabled: bool) -> Self {
        self.use_remote_autoscaler = enabled;
        self
    }

    pub fn with_autoscaler_base_url(mut self, url: impl Into<String>) -> Self {
        self.autoscaler_base_url = url.into();
        self
    }

    pub fn with_tunnel_host(mut self, host: impl Into<String>) -> Self {
        self.tunnel_host = host.into();
        self
    }

    pub fn with_remote_ports(mut self, default: u16, alt: u16) -> Self {
        self.remote_port_default = default;
        self.remote_port_alt = alt;
        self
    }

    pub fn with_alt_port_marker(mut self, marker: impl Into<String>) -> Self {
        self.alt_port_marker = marker.into();
        self
    }

    pub fn with_local_port_base(mut self, port: u16) -> Self {
        self.local_port_base = port;
        self
    }

    /// Register a fallback model for a model family. Use family `"*"` for a
    /// catch-all.
    pub fn with_fallback(
        mut self,
        family: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        self.fallbacks.insert(family.into(), model.into());
        self
    }

    pub fn with_fallback_attempts(mut self, attempts: u32) -> Self {
        self.fallback_attempts = attempts;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.retry_base_delay_ms = ms;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Register an API key under its environment-variable name (e.g.
    /// `OPENAI_API_KEY`), overriding whatever `from_env` captured.
    pub fn with_api_key(mut self, env: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_keys.insert(env.into(), key.into());
        self
    }

    /// Look up a resolved API key by its environment-variable name.
    pub fn api_key(&self, env: &str) -> Option<&str> {
        self.api_keys.get(env).map(String::as_str)
    }

    /// Look up the configured fallback for a model identifier, by family
    /// first and then the `"*"` catch-all. Returns `None` when the model
    /// already *is* its own fallback (prevents a fallback loop).
    pub fn fallback_for(&self, model: &str) -> Option<&str> {
        let family = model.split('/').next().unwrap_or(model);
        let fallback = self
            .fallbacks
            .get(family)
            .or_else(|| self.fallbacks.get("*"))?;
        if fallback == model {
            return None;
        }
        Some(fallback.as_str())
    }
}

/// Parse a bool-like environment value. Accepts `1/0`, `true/false`,
/// `yes/no`, `on/off` (case-insensitive).
fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================
