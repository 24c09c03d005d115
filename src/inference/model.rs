//! The seam between the conversation driver and a model provider.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::InferenceError;
use super::types::{ChatMessage, StreamChunk, ToolDefinition};

/// Stream of incremental model output for one round-trip.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, InferenceError>>;

/// A chat model that streams text and tool calls.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Start one streamed completion.
    ///
    /// `tools: None` means the model is offered no tools for this turn.
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChunkStream, InferenceError>;
}
