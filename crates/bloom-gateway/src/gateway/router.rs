//! Backend Router — Model Identifier Classification
//!
//! A pure function from (model identifier, config) to a [`BackendDescriptor`]
//! describing which backend serves the model and what setup it needs.
//!
//! ## Classification
//!
//! ```text
//! model contains '/' and prefix is not a known hosted provider
//!   → adapter-backed (RemoteAdapterServer)
//!       use_remote_autoscaler = true  → autoscaler base URL, no tunnel
//!       use_remote_autoscaler = false → SSH tunnel to a fixed remote port
//!         (alternate port when the name contains the configured marker)
//! otherwise
//!   → hosted provider, identifier normalized (prefix stripped), no tunnel,
//!     no adapter step
//! ```
//!
//! `resolve` is side-effect-free and recomputed per call; descriptors are
//! never stored. Adding a provider is a one-place change: a new
//! [`Provider`] variant and its three accessors.

use super::config::GatewayConfig;

// ============================================================================
// Provider
// ============================================================================

/// The closed set of hosted providers the gateway can reach directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenRouter,
    OpenAi,
    Anthropic,
    Google,
    Together,
}

impl Provider {
    /// All providers, in prefix-matching order.
    pub const ALL: [Provider; 5] = [
        Provider::OpenRouter,
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Google,
        Provider::Together,
    ];

    /// The model-identifier prefix that selects this provider.
    pub fn prefix(&self) -> &'static str {
        match self {
            Provider::OpenRouter => "openrouter/",
            Provider::OpenAi => "openai/",
            Provider::Anthropic => "anthropic/",
            Provider::Google => "google/",
            Provider::Together => "together/",
        }
    }

    /// OpenAI-compatible base URL for this provider.
    pub fn base_url(&self) -> &'static str {
        match self {
            Provider::OpenRouter => "https://openrouter.ai/api/v1",
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com/v1",
            Provider::Google => "https://generativelanguage.googleapis.com/v1beta/openai",
            Provider::Together => "https://api.together.xyz/v1",
        }
    }

    /// Environment variable holding this provider's API key.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Provider::OpenRouter => "OPENROUTER_API_KEY",
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Google => "GOOGLE_API_KEY",
            Provider::Together => "TOGETHER_API_KEY",
        }
    }

    /// Match a model identifier against the known prefixes.
    fn from_prefix(model: &str) -> Option<Provider> {
        Provider::ALL
            .into_iter()
            .find(|p| model.starts_with(p.prefix()))
    }
}

// ============================================================================
// BackendDescriptor
// ============================================================================

/// Which kind of backend serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// A vLLM server holding LoRA adapters, reached via tunnel or autoscaler.
    RemoteAdapterServer,
    /// A third-party inference API reached directly over the internet.
    HostedProvider(Provider),
}

/// The resolved routing decision for one model identifier.
///
/// Immutable and recomputed per call. For the tunnel path `base_url` is
/// `None` — the executor fills it in after acquiring the tunnel's local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    pub base_url: Option<String>,
    pub requires_tunnel: bool,
    pub remote_port: Option<u16>,
    /// The identifier to send over the wire. For adapter-backed models this
    /// is the full adapter name; for hosted providers the prefix is
    /// stripped (OpenRouter's remainder keeps its inner slashes).
    pub model: String,
}

impl BackendDescriptor {
    /// Whether this model needs the adapter-load step before first use.
    pub fn is_adapter_backed(&self) -> bool {
        matches!(self.kind, BackendKind::RemoteAdapterServer)
    }
}

// ============================================================================
// resolve
// ============================================================================

/// Classify a model identifier into a backend descriptor.
///
/// Pure: safe to call repeatedly and concurrently.
pub fn resolve(model: &str, config: &GatewayConfig) -> BackendDescriptor {
    if let Some(provider) = Provider::from_prefix(model) {
        let normalized = model[provider.prefix().len()..].to_string();
        return BackendDescriptor {
            kind: BackendKind::HostedProvider(provider),
            base_url: Some(provider.base_url().to_string()),
            requires_tunnel: false,
            remote_port: None,
            model: normalized,
        };
    }

    if model.contains('/') {
        // Adapter-backed: a fine-tuned LoRA addressed by its full name.
        let remote_port = if model.contains(&config.alt_port_marker) {
            config.remote_port_alt
        } else {
            config.remote_port_default
        };

        if config.use_remote_autoscaler {
            return BackendDescriptor {
                kind: BackendKind::RemoteAdapterServer,
                base_url: Some(config.autoscaler_base_url.clone()),
                requires_tunnel: false,
                remote_port: None,
                model: model.to_string(),
            };
        }

        return BackendDescriptor {
            kind: BackendKind::RemoteAdapterServer,
            base_url: None,
            requires_tunnel: true,
            remote_port: Some(remote_port),
            model: model.to_string(),
        };
    }

    // Bare identifier: hosted, OpenAI-compatible default.
    BackendDescriptor {
        kind: BackendKind::HostedProvider(Provider::OpenAi),
        base_url: Some(Provider::OpenAi.base_url().to_string()),
        requires_tunnel: false,
        remote_port: None,
        model: model.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================
