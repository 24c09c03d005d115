//! Shared types for the agent core.
//!
//! Conversation messages, tool results, client-facing stream events and the
//! chat request shape used by the ConversationDriver and ToolRouter.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub use crate::inference::types::{Role, ToolCallRequest};

use super::errors::{ToolError, ToolErrorKind};
use crate::inference::types::{ChatMessage, ToolCallResponse};

// ─── Conversation Messages ──────────────────────────────────────────────────

/// A single message in a request-scoped conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    /// Text content; `None` for assistant turns that only call tools.
    pub content: Option<String>,
    /// Tool calls proposed in this (assistant) message, in declaration order.
    pub tool_calls: Vec<ToolCallRequest>,
    /// For `tool` role: the id of the call this result answers.
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

impl From<ChatMessage> for Message {
    fn from(msg: ChatMessage) -> Self {
        Self {
            role: msg.role,
            content: msg.content,
            tool_calls: msg
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(ToolCallRequest::from)
                .collect(),
            tool_call_id: msg.tool_call_id,
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
            tool_call_id: msg.tool_call_id.clone(),
            tool_calls: if msg.tool_calls.is_empty() {
                None
            } else {
                Some(msg.tool_calls.iter().map(ToolCallResponse::from).collect())
            },
        }
    }
}

// ─── Tool Results ───────────────────────────────────────────────────────────

/// The outcome of dispatching one tool call. The call id is always preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub outcome: Result<Value, ToolError>,
    pub execution_time_ms: u64,
}

impl ToolResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The error kind, if the call failed.
    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        self.outcome.as_ref().err().map(|e| e.kind)
    }

    /// The JSON document the model sees as the tool message content.
    ///
    /// `{"ok": true, "result": …}` or
    /// `{"ok": false, "error": …, "error_kind": …, "details": …}`.
    pub fn to_model_payload(&self) -> Value {
        match &self.outcome {
            Ok(payload) => json!({ "ok": true, "result": payload }),
            Err(e) => json!({
                "ok": false,
                "error": e.message,
                "error_kind": e.kind,
                "details": e.details,
            }),
        }
    }
}

// ─── Stream Events ──────────────────────────────────────────────────────────

/// Lifecycle state reported in `tool.status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolState {
    Started,
    Finished,
}

/// A client-visible event. Serialized as one SSE `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "text.delta")]
    TextDelta { content: String },
    #[serde(rename = "tool.status")]
    ToolStatus { name: String, state: ToolState },
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "error")]
    Error { error: String },
}

impl StreamEvent {
    /// `done` and `error` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }
}

// ─── Requests ───────────────────────────────────────────────────────────────

/// Whether the model may call tools in this request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatMode {
    #[default]
    #[serde(rename = "tools+chat")]
    ToolsAndChat,
    #[serde(rename = "chat-only")]
    ChatOnly,
}

/// One user turn plus optional prior history.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub prompt: String,
    pub history: Vec<Message>,
    pub mode: ChatMode,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            history: Vec::new(),
            mode: ChatMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ChatMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
