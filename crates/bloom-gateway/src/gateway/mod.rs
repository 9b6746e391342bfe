//! LLM Inference Gateway Module
//!
//! This module provides the complete call path between evaluation code and
//! the heterogeneous inference backends it targets:
//!
//! ## Routing & Transport
//!
//! - **[`router`]** — Pure classification of model identifiers into
//!   [`BackendDescriptor`]s (adapter-backed vs hosted provider)
//! - **[`tunnel`]** — [`TunnelManager`]: at most one SSH local forward per
//!   remote target, shared across concurrent callers, health-probed
//! - **[`wire`]** — OpenAI-compatible request/response bodies
//!
//! ## Lifecycle & Execution
//!
//! - **[`adapter`]** — [`AdapterManager`]: at-most-once LoRA loading under
//!   concurrency via two-level locking
//! - **[`executor`]** — [`Gateway`]: retry/backoff/fallback policy,
//!   structured-response validation, response cache, the infallible
//!   [`CallResult`] boundary
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                  Evaluation / Judging Code                    │
//! └────────────────────────┬──────────────────────────────────────┘
//!                          │ call(messages, model, options)
//!                          ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Gateway                                │
//! │  ┌──────────┐   resolve    ┌─────────────────────────────┐   │
//! │  │  router  │─────────────▶│ adapter-backed?             │   │
//! │  └──────────┘              └──────┬──────────────┬───────┘   │
//! │                               YES │           NO │           │
//! │                                   ▼              ▼           │
//! │                     ┌───────────────┐   ┌──────────────┐     │
//! │                     │ TunnelManager │   │ hosted       │     │
//! │                     │ AdapterManager│   │ provider URL │     │
//! │                     └───────┬───────┘   └──────┬───────┘     │
//! │                             └────────┬─────────┘             │
//! │                                      ▼                       │
//! │                    retry loop ─ backoff ─ overload fallback  │
//! │                                      ▼                       │
//! │                    CallResult (never Err, never panic)       │
//! └───────────────────────────────────────────────────────────────┘
//! ```

// ---------------------------------------------------------------------------
// Core types & configuration
// ---------------------------------------------------------------------------

/// Core types: ChatMessage, CallOptions, CallResult, CallLog, GatewayError.
pub mod types;

/// Gateway configuration and its environment overrides.
pub mod config;

// ---------------------------------------------------------------------------
// Routing & transport
// ---------------------------------------------------------------------------

/// Pure model-identifier classification into backend descriptors.
pub mod router;

/// OpenAI-compatible wire bodies for completions, model lists, and
/// adapter loading.
pub mod wire;

/// SSH tunnel lifecycle: one shared forward per remote target.
pub mod tunnel;

// ---------------------------------------------------------------------------
// Lifecycle & execution
// ---------------------------------------------------------------------------

/// At-most-once LoRA adapter loading.
pub mod adapter;

/// The call executor and the public `Gateway` entry point.
pub mod executor;

// ── Re-exports: types & config ──

pub use config::{GatewayConfig, AUTOSCALER_KEY_ENV, USE_AUTOSCALER_ENV};
pub use types::{
    AttemptOutcome, CallAttempt, CallLog, CallOptions, CallResult, ChatMessage, ChatRole,
    GatewayError,
};

// ── Re-exports: routing & transport ──

pub use router::{resolve, BackendDescriptor, BackendKind, Provider};
pub use tunnel::{SshSpawner, TunnelManager, TunnelProcess, TunnelSpawner};

// ── Re-exports: lifecycle & execution ──

pub use adapter::AdapterManager;
pub use executor::Gateway;
