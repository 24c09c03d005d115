//! Inference Client: OpenAI-compatible chat completions.
//!
//! This module handles all communication with the model provider:
//! - Streaming chat completions over SSE
//! - Tool call fragment accumulation
//! - Fallback chain across configured endpoints
//! - The `ChatModel` trait the conversation driver depends on
//!
//! Any endpoint speaking the Chat Completions API works; switching provider
//! is a config change, not a code change.

pub mod client;
pub mod config;
pub mod errors;
pub mod model;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use client::InferenceClient;
pub use config::{ModelConfig, ModelsConfig};
pub use errors::InferenceError;
pub use model::{ChatModel, ChunkStream};
pub use types::{ChatMessage, Role, StreamChunk, ToolCallRequest, ToolDefinition};
