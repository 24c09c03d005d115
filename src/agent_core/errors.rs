//! Agent Core error types.
//!
//! `AgentError` covers request-level failures. `ToolError` is the structured
//! failure of a single tool call; it is reported back to the model as data
//! and never aborts the conversation on its own.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::stores::StoreError;

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Client-supplied history breaks the conversation invariants.
    #[error("invalid history: {reason}")]
    InvalidHistory { reason: String },

    /// The same tool name was registered twice.
    #[error("tool '{name}' is already registered")]
    DuplicateTool { name: String },

    /// Vocabulary or registry configuration is unusable.
    #[error("configuration error: {reason}")]
    Config { reason: String },
}

// ─── Tool Errors ────────────────────────────────────────────────────────────

/// Classification of a failed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Malformed or unmappable arguments.
    ValidationError,
    /// Ordinal out of range, or canonical id absent.
    NotFound,
    /// Store or third-party failure.
    UpstreamError,
    /// Unexpected failure; ends the request.
    InternalError,
    /// Tool name not registered.
    UnknownTool,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::ValidationError => "validation_error",
            ToolErrorKind::NotFound => "not_found",
            ToolErrorKind::UpstreamError => "upstream_error",
            ToolErrorKind::InternalError => "internal_error",
            ToolErrorKind::UnknownTool => "unknown_tool",
        }
    }
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed tool call: kind, a message for the model, and structured details.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
    pub details: Value,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::ValidationError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::NotFound, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::UpstreamError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InternalError, message)
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(ToolErrorKind::UnknownTool, format!("unknown tool '{name}'"))
            .with_details(json!({ "name": name }))
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl From<StoreError> for ToolError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { kind, ref id } => ToolError::not_found(e.to_string())
                .with_details(json!({ "resource_kind": kind, "id": id })),
            StoreError::Upstream { ref service, .. } => {
                ToolError::upstream(e.to_string()).with_details(json!({ "service": service }))
            }
            StoreError::Database { .. } | StoreError::InvalidData { .. } => {
                ToolError::upstream(e.to_string())
            }
        }
    }
}

// ─── Emitter Errors ─────────────────────────────────────────────────────────

/// Why an event could not be written to the client stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmitError {
    /// The client went away.
    #[error("client disconnected")]
    Disconnected,

    /// A `done` or `error` event was already sent.
    #[error("stream already terminated")]
    Terminated,
}
