//! Agent Core: tool-calling conversation orchestration.
//!
//! Submodules:
//! - `registry`: Operation registry, argument schemas and typed handlers
//! - `operations`: The grocery, task, calendar and Home Assistant tools
//! - `resolver`: Ordinal / canonical-id resource references
//! - `vocabulary`: Human status words to canonical statuses
//! - `tool_router`: Dispatches one tool call to its handler
//! - `conversation`: Request-scoped message history and its invariants
//! - `driver`: The model ⇄ tools turn loop
//! - `emitter`: Ordered client events with a single terminal event
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod driver;
pub mod emitter;
pub mod errors;
pub mod operations;
pub mod registry;
pub mod resolver;
pub mod tool_router;
pub mod types;
pub mod vocabulary;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use conversation::{validate_history, Conversation};
pub use driver::{ConversationDriver, DriverOutcome, DriverSettings, DriverState};
pub use emitter::StreamEmitter;
pub use errors::{AgentError, EmitError, ToolError, ToolErrorKind};
pub use operations::{default_registry, SYSTEM_PROMPT};
pub use registry::OperationRegistry;
pub use resolver::IdentifierResolver;
pub use tool_router::ToolRouter;
pub use types::{ChatMode, ChatRequest, Message, StreamEvent, ToolResult, ToolState};
pub use vocabulary::Vocabulary;
