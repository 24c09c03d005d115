//! ToolRouter: dispatches model tool calls to registered operations.
//!
//! The ToolRouter is the bridge between the model's tool call decisions and
//! the operation handlers. For every call it:
//! - Looks the tool up in the registry
//! - Parses and validates the arguments against the tool's schema
//! - Resolves resource references and normalizes status words
//! - Invokes the handler exactly once, catching panics
//! - Bounds the size of the payload handed back to the model
//!
//! `dispatch` never fails: every outcome, including unexpected ones, comes
//! back as a [`ToolResult`] carrying the original call id.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::{json, Map, Value};

use crate::stores::{Backends, ScopeKey};

use super::errors::ToolError;
use super::registry::{ArgRole, OperationRegistry, ToolContext, ToolSpec};
use super::resolver::IdentifierResolver;
use super::types::{ToolCallRequest, ToolResult};
use super::vocabulary::Vocabulary;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Default cap on a serialized tool payload, in bytes.
pub const DEFAULT_MAX_RESULT_CHARS: usize = 8_000;

/// Replacement for secret-looking argument values in logs.
const MASK: &str = "***MASKED***";

const SECRET_KEY_PARTS: &[&str] = &["api_key", "token", "password", "secret", "credentials"];

// ─── ToolRouter ─────────────────────────────────────────────────────────────

pub struct ToolRouter {
    registry: Arc<OperationRegistry>,
    resolver: IdentifierResolver,
    vocabulary: Arc<Vocabulary>,
    backends: Backends,
    max_result_chars: usize,
}

impl ToolRouter {
    pub fn new(
        registry: Arc<OperationRegistry>,
        vocabulary: Arc<Vocabulary>,
        backends: Backends,
    ) -> Self {
        Self {
            resolver: IdentifierResolver::new(Arc::clone(&backends.listing)),
            registry,
            vocabulary,
            backends,
            max_result_chars: DEFAULT_MAX_RESULT_CHARS,
        }
    }

    pub fn with_max_result_chars(mut self, max: usize) -> Self {
        self.max_result_chars = max;
        self
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Execute one tool call. Exactly one handler attempt; no retries.
    pub async fn dispatch(&self, call: &ToolCallRequest, scope: &ScopeKey) -> ToolResult {
        let start = Instant::now();

        let outcome = self.execute(call, scope).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => tracing::info!(
                tool = %call.name,
                call_id = %call.id,
                elapsed_ms,
                "tool call succeeded"
            ),
            Err(e) => tracing::warn!(
                tool = %call.name,
                call_id = %call.id,
                elapsed_ms,
                error_kind = %e.kind,
                error = %e.message,
                "tool call failed"
            ),
        }

        ToolResult {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            outcome,
            execution_time_ms: elapsed_ms,
        }
    }

    async fn execute(&self, call: &ToolCallRequest, scope: &ScopeKey) -> Result<Value, ToolError> {
        let spec = self.registry.get(&call.name)?;
        let mut args = parse_arguments(&call.raw_arguments)?;

        let masked = mask_secrets(&Value::Object(args.clone()));
        tracing::debug!(
            tool = %call.name,
            call_id = %call.id,
            args = %masked,
            "dispatching tool call"
        );

        spec.validate(&mut args)?;
        self.prepare(spec, &mut args, scope).await?;

        let ctx = ToolContext {
            scope: scope.clone(),
            backends: self.backends.clone(),
        };
        let handler = spec.handler();

        let payload = match AssertUnwindSafe(handler(args, ctx)).catch_unwind().await {
            Ok(result) => result?,
            Err(panic) => {
                let reason = panic_message(&*panic);
                tracing::error!(tool = %call.name, call_id = %call.id, reason = %reason, "tool handler panicked");
                return Err(ToolError::internal(format!("tool '{}' failed unexpectedly", call.name)));
            }
        };

        Ok(self.bound_payload(payload))
    }

    /// Replace references with canonical ids and status words with canonical
    /// statuses. Runs after validation, so present values are strings.
    async fn prepare(
        &self,
        spec: &ToolSpec,
        args: &mut Map<String, Value>,
        scope: &ScopeKey,
    ) -> Result<(), ToolError> {
        for param in spec.params() {
            let Some(raw) = args.get(param.name()).and_then(Value::as_str) else {
                continue;
            };
            let canonical = match param.role() {
                ArgRole::Plain => continue,
                ArgRole::ResourceRef(kind) => self.resolver.resolve(kind, raw, scope).await?,
                ArgRole::StatusToken(kind) => self.vocabulary.normalize(kind, raw)?.as_str().to_string(),
            };
            args.insert(param.name().to_string(), Value::String(canonical));
        }
        Ok(())
    }

    /// Oversized payloads are replaced with a truncated preview.
    fn bound_payload(&self, payload: Value) -> Value {
        let text = payload.to_string();
        if text.len() <= self.max_result_chars {
            return payload;
        }
        json!({
            "truncated": true,
            "original_chars": text.len(),
            "preview": truncate_utf8(&text, self.max_result_chars),
        })
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Parse raw argument text. Empty text means no arguments.
fn parse_arguments(raw: &str) -> Result<Map<String, Value>, ToolError> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ToolError::validation("tool arguments must be a JSON object")),
        Err(e) => Err(ToolError::validation(format!("tool arguments are not valid JSON: {e}"))
            .with_details(json!({ "raw_arguments": truncate_utf8(raw, 200) }))),
    }
}

/// Copy of `value` with secret-looking object fields replaced, recursively.
pub fn mask_secrets(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let lower = k.to_lowercase();
                    if SECRET_KEY_PARTS.iter().any(|part| lower.contains(part)) {
                        (k.clone(), Value::String(MASK.into()))
                    } else {
                        (k.clone(), mask_secrets(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_secrets).collect()),
        other => other.clone(),
    }
}

/// Truncate to at most `max_bytes`, backing off to a char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::agent_core::errors::ToolErrorKind;
    use crate::agent_core::operations::default_registry;
    use crate::agent_core::registry::{ParamSpec, ToolSpec};
    use crate::agent_core::test_support::{memory_backends, FakeHome};
    use crate::stores::{GroceryStore, NewGroceryItem};

    fn router_with(registry: OperationRegistry) -> (ToolRouter, Backends) {
        let (_, backends) = memory_backends(Arc::new(FakeHome::default()));
        let router = ToolRouter::new(
            Arc::new(registry),
            Arc::new(Vocabulary::default()),
            backends.clone(),
        );
        (router, backends)
    }

    fn router() -> (ToolRouter, Backends) {
        router_with(default_registry(&Vocabulary::default()).unwrap())
    }

    fn call(name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: format!("call_{name}"),
            name: name.into(),
            raw_arguments: args.to_string(),
        }
    }

    async fn add(backends: &Backends, name: &str) -> String {
        backends
            .groceries
            .add_grocery(
                &ScopeKey::default(),
                NewGroceryItem {
                    name: name.into(),
                    qty: 1,
                    notes: None,
                },
            )
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_ordinal_and_status_word_are_canonicalized() {
        let (router, backends) = router();
        add(&backends, "milk").await;
        let second = add(&backends, "eggs").await;

        let result = router
            .dispatch(
                &call("update_grocery_status", json!({ "id": 2, "status": "Ordered" })),
                &ScopeKey::default(),
            )
            .await;

        let payload = result.outcome.unwrap();
        assert_eq!(payload["item"]["id"], second);
        assert_eq!(payload["item"]["status"], "purchased");
        assert_eq!(result.call_id, "call_update_grocery_status");
    }

    #[tokio::test]
    async fn test_empty_list_ordinal_is_not_found() {
        let (router, _) = router();
        let result = router
            .dispatch(
                &call("update_task_status", json!({ "id": "1", "status": "done" })),
                &ScopeKey::default(),
            )
            .await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::NotFound));
        let payload = result.to_model_payload();
        assert_eq!(payload["details"]["length"], 0);
    }

    #[tokio::test]
    async fn test_unmapped_status_never_reaches_store() {
        let (router, backends) = router();
        let id = add(&backends, "milk").await;

        let result = router
            .dispatch(
                &call("update_grocery_status", json!({ "id": id, "status": "Shipped" })),
                &ScopeKey::default(),
            )
            .await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::ValidationError));

        let items = backends
            .groceries
            .list_groceries(&ScopeKey::default(), None, 10)
            .await
            .unwrap();
        assert_eq!(items[0].status.as_str(), "not_purchased");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (router, _) = router();
        let result = router
            .dispatch(&call("delete_everything", json!({})), &ScopeKey::default())
            .await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::UnknownTool));
        assert_eq!(result.call_id, "call_delete_everything");
    }

    #[tokio::test]
    async fn test_malformed_arguments() {
        let (router, _) = router();
        for raw in ["{not json", "[1, 2]", "\"milk\""] {
            let result = router
                .dispatch(
                    &ToolCallRequest {
                        id: "c".into(),
                        name: "add_to_groceries".into(),
                        raw_arguments: raw.into(),
                    },
                    &ScopeKey::default(),
                )
                .await;
            assert_eq!(result.error_kind(), Some(ToolErrorKind::ValidationError), "raw: {raw}");
        }
    }

    #[tokio::test]
    async fn test_empty_arguments_are_an_empty_object() {
        let (router, _) = router();
        let result = router
            .dispatch(
                &ToolCallRequest {
                    id: "c".into(),
                    name: "list_tasks".into(),
                    raw_arguments: String::new(),
                },
                &ScopeKey::default(),
            )
            .await;
        assert!(result.is_ok());
    }

    #[derive(Deserialize)]
    struct NoArgs {}

    #[tokio::test]
    async fn test_handler_panic_is_internal_error() {
        let mut registry = OperationRegistry::new();
        registry
            .register(ToolSpec::new(
                "explode",
                "Always panics.",
                vec![],
                |_: NoArgs, _ctx| async move {
                    if true {
                        panic!("kaboom");
                    }
                    Ok(Value::Null)
                },
            ))
            .unwrap();
        let (router, _) = router_with(registry);

        let result = router.dispatch(&call("explode", json!({})), &ScopeKey::default()).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::InternalError));
        assert!(!result.to_model_payload()["error"].as_str().unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_oversized_payload_is_truncated() {
        let mut registry = OperationRegistry::new();
        registry
            .register(ToolSpec::new(
                "big",
                "Returns a lot.",
                vec![ParamSpec::string("fill")],
                |_: NoArgs, _ctx| async move { Ok(json!({ "blob": "é".repeat(10_000) })) },
            ))
            .unwrap();
        let (router, _) = router_with(registry);
        let router = router.with_max_result_chars(101);

        let payload = router
            .dispatch(&call("big", json!({})), &ScopeKey::default())
            .await
            .outcome
            .unwrap();
        assert_eq!(payload["truncated"], true);
        assert!(payload["preview"].as_str().unwrap().len() <= 101);
    }

    #[test]
    fn test_mask_secrets_recurses() {
        let masked = mask_secrets(&json!({
            "domain": "light",
            "API_KEY": "abc",
            "data": { "access_token": "xyz", "brightness": 80 },
            "list": [{ "password": "p" }],
        }));
        assert_eq!(masked["domain"], "light");
        assert_eq!(masked["API_KEY"], MASK);
        assert_eq!(masked["data"]["access_token"], MASK);
        assert_eq!(masked["data"]["brightness"], 80);
        assert_eq!(masked["list"][0]["password"], MASK);
    }

    #[test]
    fn test_truncate_utf8_respects_char_boundary() {
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }
}
