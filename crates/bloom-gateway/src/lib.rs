//! # bloom-gateway
//!
//! A gateway crate that gives evaluation and judging code a single call
//! surface over heterogeneous LLM backends: fine-tuned LoRA adapters on a
//! remote vLLM box (reached over an SSH tunnel or a serverless autoscaler)
//! and hosted OpenAI-compatible providers.
//!
//! The entry point is [`gateway::Gateway`]. Construct one per process and
//! issue calls through [`gateway::Gateway::call`], which never returns `Err`
//! and never panics — failures come back inside [`gateway::CallResult`]
//! together with the full attempt log.

pub mod gateway;

pub use gateway::{
    CallLog, CallOptions, CallResult, ChatMessage, ChatRole, Gateway, GatewayConfig, GatewayError,
};
