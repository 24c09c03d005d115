//! Conversation: the request-scoped message history sent to the model.
//!
//! Responsibilities:
//! - Own the ordered messages of one request (system prompt first)
//! - Seed from client-supplied history after validating it
//! - Enforce that every tool message answers a call from the assistant
//!   message it follows
//! - Build `Vec<ChatMessage>` for the inference client

use std::collections::HashSet;

use crate::inference::types::{ChatMessage, Role};

use super::errors::AgentError;
use super::types::{Message, ToolCallRequest, ToolResult};

// ─── Conversation ───────────────────────────────────────────────────────────

/// Ordered messages for one request. Not persisted.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    /// Start a conversation with the system prompt.
    pub fn new(system_prompt: &str) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    /// Append client-supplied history. All or nothing: invalid history leaves
    /// the conversation untouched.
    pub fn seed(&mut self, history: Vec<Message>) -> Result<(), AgentError> {
        validate_history(&history)?;
        self.messages.extend(history);
        Ok(())
    }

    pub fn push_user(&mut self, prompt: impl Into<String>) {
        self.messages.push(Message::user(prompt));
    }

    /// Record the assistant turn, including the tool calls it proposed.
    pub fn push_assistant(&mut self, content: Option<String>, tool_calls: Vec<ToolCallRequest>) {
        self.messages.push(Message::assistant(content, tool_calls));
    }

    /// Record a tool result as a `tool` message.
    ///
    /// Fails if the result does not answer an open call of the preceding
    /// assistant message.
    pub fn push_tool_result(&mut self, result: &ToolResult) -> Result<(), AgentError> {
        check_answerable(&self.messages, &result.call_id)
            .map_err(|reason| AgentError::InvalidHistory { reason })?;
        self.messages.push(Message::tool(
            result.call_id.clone(),
            result.to_model_payload().to_string(),
        ));
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Wire-format messages for the inference client.
    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(ChatMessage::from).collect()
    }
}

// ─── Validation ─────────────────────────────────────────────────────────────

/// Check client-supplied history.
///
/// - No `system` messages (the server owns the system prompt).
/// - Every `tool` message carries a `tool_call_id` naming a call of the
///   assistant message it follows, answered at most once.
/// - Every call of an assistant message is answered before the next
///   non-tool message or the end of the history.
pub fn validate_history(history: &[Message]) -> Result<(), AgentError> {
    let invalid = |position: usize, reason: String| AgentError::InvalidHistory {
        reason: format!("message {position}: {reason}"),
    };
    let mut open: Vec<&str> = Vec::new();

    for (position, msg) in history.iter().enumerate() {
        if msg.role != Role::Tool {
            if let Some(id) = open.first() {
                return Err(invalid(position, format!("tool call '{id}' was never answered")));
            }
        }

        match msg.role {
            Role::System => {
                return Err(invalid(position, "system messages are not accepted".into()));
            }
            Role::Tool => {
                let call_id = msg
                    .tool_call_id
                    .as_deref()
                    .ok_or_else(|| invalid(position, "tool message without tool_call_id".into()))?;
                check_answerable(&history[..position], call_id)
                    .map_err(|reason| invalid(position, reason))?;
                open.retain(|id| *id != call_id);
            }
            Role::Assistant => {
                let mut ids = HashSet::new();
                for call in &msg.tool_calls {
                    if !ids.insert(call.id.as_str()) {
                        return Err(invalid(position, format!("tool call id '{}' repeated", call.id)));
                    }
                }
                open = msg.tool_calls.iter().map(|c| c.id.as_str()).collect();
            }
            Role::User => {}
        }
    }

    match open.first() {
        Some(id) => Err(AgentError::InvalidHistory {
            reason: format!("tool call '{id}' was never answered"),
        }),
        None => Ok(()),
    }
}

/// Whether a tool message for `call_id` may be appended after `preceding`.
fn check_answerable(preceding: &[Message], call_id: &str) -> Result<(), String> {
    let mut answered = HashSet::new();

    for msg in preceding.iter().rev() {
        if msg.role == Role::Tool {
            if let Some(ref id) = msg.tool_call_id {
                answered.insert(id.as_str());
            }
            continue;
        }

        if msg.role != Role::Assistant {
            break;
        }
        if !msg.tool_calls.iter().any(|c| c.id == call_id) {
            return Err(format!(
                "tool result '{call_id}' does not match a call of the preceding assistant message"
            ));
        }
        if answered.contains(call_id) {
            return Err(format!("tool call '{call_id}' answered more than once"));
        }
        return Ok(());
    }

    Err(format!(
        "tool result '{call_id}' does not follow an assistant message with tool calls"
    ))
}

// ─── Tests ──────────────────────────────────────────────────────────────────
