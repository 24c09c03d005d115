//! Operation Registry: the closed set of tools the model may call.
//!
//! Each [`ToolSpec`] carries a name, a description, a typed argument schema
//! and an async handler. The registry is built once at startup and is
//! read-only afterwards; the same schema drives both the JSON Schema sent to
//! the model and the validation applied to its arguments.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::DateTime;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use crate::inference::types::{FunctionDefinition, ToolDefinition};
use crate::stores::{Backends, ResourceKind, ScopeKey};

use super::errors::{AgentError, ToolError};

// ─── Argument Schema ────────────────────────────────────────────────────────

/// Wire type of one argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    String,
    Integer { min: i64, max: i64 },
    Object,
    /// RFC 3339 timestamp string.
    DateTime,
    Enum(&'static [&'static str]),
}

/// What the dispatcher does with an argument before the handler sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgRole {
    Plain,
    /// Ordinal or canonical id, resolved to a canonical id.
    ResourceRef(ResourceKind),
    /// Human status word, normalized to the canonical status.
    StatusToken(ResourceKind),
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    name: &'static str,
    ty: ParamType,
    required: bool,
    description: String,
    role: ArgRole,
}

impl ParamSpec {
    pub fn new(name: &'static str, ty: ParamType) -> Self {
        Self {
            name,
            ty,
            required: false,
            description: String::new(),
            role: ArgRole::Plain,
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self::new(name, ParamType::String)
    }

    pub fn integer(name: &'static str, min: i64, max: i64) -> Self {
        Self::new(name, ParamType::Integer { min, max })
    }

    pub fn datetime(name: &'static str) -> Self {
        Self::new(name, ParamType::DateTime)
    }

    pub fn object(name: &'static str) -> Self {
        Self::new(name, ParamType::Object)
    }

    pub fn one_of(name: &'static str, values: &'static [&'static str]) -> Self {
        Self::new(name, ParamType::Enum(values))
    }

    /// A reference to an existing resource: list position or id.
    pub fn resource_ref(name: &'static str, kind: ResourceKind) -> Self {
        let mut spec = Self::string(name);
        spec.role = ArgRole::ResourceRef(kind);
        spec
    }

    /// A human status word for `kind`.
    pub fn status_token(name: &'static str, kind: ResourceKind) -> Self {
        let mut spec = Self::string(name);
        spec.role = ArgRole::StatusToken(kind);
        spec
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn role(&self) -> ArgRole {
        self.role
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    fn json_schema(&self) -> Value {
        let mut schema = match &self.ty {
            ParamType::String if matches!(self.role, ArgRole::ResourceRef(_)) => {
                json!({ "type": ["integer", "string"] })
            }
            ParamType::String => json!({ "type": "string" }),
            ParamType::Integer { min, max } => {
                json!({ "type": "integer", "minimum": min, "maximum": max })
            }
            ParamType::Object => json!({ "type": "object" }),
            ParamType::DateTime => json!({ "type": "string", "format": "date-time" }),
            ParamType::Enum(values) => json!({ "type": "string", "enum": values }),
        };
        if !self.description.is_empty() {
            schema["description"] = Value::String(self.description.clone());
        }
        schema
    }

    /// Check one present, non-null value. Integers given for a resource
    /// reference are rewritten to their string form.
    fn check(&self, value: &mut Value) -> Result<(), ToolError> {
        let fail = |expected: String| {
            Err(ToolError::validation(format!(
                "argument '{}' must be {expected}",
                self.name
            ))
            .with_details(json!({ "field": self.name, "expected": expected })))
        };

        match &self.ty {
            ParamType::String => {
                if let (ArgRole::ResourceRef(_), Some(n)) = (self.role, value.as_i64()) {
                    *value = Value::String(n.to_string());
                }
                match value.as_str() {
                    Some(s) if self.required && s.trim().is_empty() => {
                        fail("a non-empty string".into())
                    }
                    Some(_) => Ok(()),
                    None => fail("a string".into()),
                }
            }
            ParamType::Integer { min, max } => match value.as_i64() {
                Some(n) if (*min..=*max).contains(&n) => Ok(()),
                _ => fail(format!("an integer between {min} and {max}")),
            },
            ParamType::Object => {
                if value.is_object() {
                    Ok(())
                } else {
                    fail("an object".into())
                }
            }
            ParamType::DateTime => match value.as_str() {
                Some(s) if DateTime::parse_from_rfc3339(s.trim()).is_ok() => Ok(()),
                _ => fail("an RFC 3339 date-time such as 2025-06-01T09:00:00Z".into()),
            },
            ParamType::Enum(values) => match value.as_str() {
                Some(s) if values.iter().any(|v| *v == s) => Ok(()),
                _ => fail(format!("one of {}", values.join(", "))),
            },
        }
    }
}

// ─── Handlers ───────────────────────────────────────────────────────────────

/// Per-call context handed to a handler.
#[derive(Clone)]
pub struct ToolContext {
    pub scope: ScopeKey,
    pub backends: Backends,
}

/// Type-erased async handler over validated, resolved arguments.
pub type ToolHandler =
    Arc<dyn Fn(Map<String, Value>, ToolContext) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

pub struct ToolSpec {
    name: &'static str,
    description: &'static str,
    params: Vec<ParamSpec>,
    handler: ToolHandler,
}

impl ToolSpec {
    /// Build a tool whose handler takes a typed argument struct `A`.
    ///
    /// Arguments are decoded inside the returned future, so a decode failure
    /// surfaces as a `validation_error` like any other.
    pub fn new<A, F, Fut>(
        name: &'static str,
        description: &'static str,
        params: Vec<ParamSpec>,
        handler: F,
    ) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ToolHandler = Arc::new(move |args, ctx| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let typed: A = serde_json::from_value(Value::Object(args))
                    .map_err(|e| ToolError::validation(format!("invalid arguments: {e}")))?;
                handler(typed, ctx).await
            })
        });

        Self {
            name,
            description,
            params,
            handler: erased,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn handler(&self) -> ToolHandler {
        Arc::clone(&self.handler)
    }

    /// OpenAI function-tool definition.
    pub fn definition(&self) -> ToolDefinition {
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|p| (p.name.to_string(), p.json_schema()))
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();

        ToolDefinition {
            r#type: "function".into(),
            function: FunctionDefinition {
                name: self.name.into(),
                description: self.description.into(),
                parameters: json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                    "additionalProperties": false,
                }),
            },
        }
    }

    /// Validate arguments in place against the schema.
    ///
    /// Rejects unknown fields, missing required fields and type or bound
    /// violations. Null optional fields are dropped.
    pub fn validate(&self, args: &mut Map<String, Value>) -> Result<(), ToolError> {
        if let Some(unknown) = args
            .keys()
            .find(|k| !self.params.iter().any(|p| p.name == k.as_str()))
        {
            return Err(ToolError::validation(format!(
                "unexpected argument '{unknown}' for {}",
                self.name
            ))
            .with_details(json!({ "field": unknown })));
        }

        for param in &self.params {
            if matches!(args.get(param.name), None | Some(Value::Null)) {
                if param.required {
                    return Err(ToolError::validation(format!(
                        "missing required argument '{}'",
                        param.name
                    ))
                    .with_details(json!({ "field": param.name })));
                }
                args.remove(param.name);
                continue;
            }
            if let Some(value) = args.get_mut(param.name) {
                param.check(value)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct OperationRegistry {
    tools: Vec<ToolSpec>,
    index: HashMap<&'static str, usize>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Names must be unique.
    pub fn register(&mut self, spec: ToolSpec) -> Result<(), AgentError> {
        if self.index.contains_key(spec.name) {
            return Err(AgentError::DuplicateTool {
                name: spec.name.to_string(),
            });
        }
        self.index.insert(spec.name, self.tools.len());
        self.tools.push(spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ToolSpec, ToolError> {
        self.index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| ToolError::unknown_tool(name))
    }

    /// Definitions for every tool, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(ToolSpec::definition).collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
