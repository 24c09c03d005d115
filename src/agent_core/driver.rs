//! ConversationDriver: the turn loop between the model and the tools.
//!
//! One driver run handles one request:
//!
//! ```text
//! StreamingText ──(no calls)──────────────────────────────▶ Done
//!      │   └────(model error)─────────────────────────────▶ UpstreamFailed
//!      ▼ (calls)
//! AwaitingTools ──▶ ExecutingTools ──▶ StreamingText …
//!                        └──(internal_error)──────────────▶ InternalFailed
//! turn limit reached ─────────────────────────────────────▶ ToolLimitExceeded
//! client gone, at any point ──────────────────────────────▶ Cancelled
//! ```
//!
//! Text is forwarded to the client as it arrives. Tool failures are folded
//! back into the conversation for the model to react to; only transport
//! failures and internal errors end the request early.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use futures::StreamExt;
use uuid::Uuid;

use crate::inference::errors::InferenceError;
use crate::inference::model::ChatModel;
use crate::inference::types::ToolDefinition;
use crate::stores::ScopeKey;

use super::conversation::Conversation;
use super::emitter::StreamEmitter;
use super::errors::{AgentError, ToolErrorKind};
use super::operations::SYSTEM_PROMPT;
use super::tool_router::ToolRouter;
use super::types::{ChatMode, ChatRequest, ToolCallRequest, ToolResult, ToolState};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Default maximum model round-trips per request.
pub const DEFAULT_MAX_TURNS: usize = 5;

const LIMIT_MESSAGE: &str = "I've reached the maximum number of steps I can take for one \
request, so I stopped here. Please check the results so far or rephrase your request.";

const NO_VALID_CALLS_MESSAGE: &str = "Tool invocation failed: no valid tool calls";

const INTERNAL_MESSAGE: &str = "An internal error occurred while running tools.";

// ─── State ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    StreamingText,
    AwaitingTools,
    ExecutingTools,
    Done,
    ToolLimitExceeded,
    UpstreamFailed,
    InternalFailed,
    Cancelled,
}

impl DriverState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            DriverState::StreamingText | DriverState::AwaitingTools | DriverState::ExecutingTools
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriverState::StreamingText => "streaming_text",
            DriverState::AwaitingTools => "awaiting_tools",
            DriverState::ExecutingTools => "executing_tools",
            DriverState::Done => "done",
            DriverState::ToolLimitExceeded => "tool_limit_exceeded",
            DriverState::UpstreamFailed => "upstream_failed",
            DriverState::InternalFailed => "internal_failed",
            DriverState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOutcome {
    pub state: DriverState,
    /// Model round-trips made.
    pub turns: usize,
    /// Tool calls dispatched.
    pub tool_calls: usize,
    /// All text sent to the client, concatenated.
    pub reply: String,
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub max_turns: usize,
    /// Dispatch the calls of one turn concurrently.
    pub parallel_tool_calls: bool,
    pub system_prompt: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            parallel_tool_calls: false,
            system_prompt: SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Why a turn or tool batch stopped short.
enum Interrupt {
    Cancelled,
    Upstream(InferenceError),
    Internal,
}

/// What one model turn produced.
struct ModelTurn {
    text: String,
    calls: Vec<ToolCallRequest>,
}

// ─── Driver ─────────────────────────────────────────────────────────────────

pub struct ConversationDriver {
    model: Arc<dyn ChatModel>,
    router: Arc<ToolRouter>,
    settings: DriverSettings,
}

impl ConversationDriver {
    pub fn new(model: Arc<dyn ChatModel>, router: Arc<ToolRouter>, settings: DriverSettings) -> Self {
        Self {
            model,
            router,
            settings,
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn router(&self) -> &ToolRouter {
        &self.router
    }

    /// Run one request to a terminal state, writing events to `emitter`.
    ///
    /// Returns `Err` only when the supplied history is invalid, in which case
    /// nothing has been emitted.
    pub async fn run(
        &self,
        request: ChatRequest,
        scope: &ScopeKey,
        emitter: &mut StreamEmitter,
    ) -> Result<DriverOutcome, AgentError> {
        let mut conversation = Conversation::new(&self.settings.system_prompt);
        conversation.seed(request.history)?;
        conversation.push_user(request.prompt);

        let tools = match request.mode {
            ChatMode::ToolsAndChat => Some(self.router.registry().definitions()),
            ChatMode::ChatOnly => None,
        };

        let mut outcome = DriverOutcome {
            state: DriverState::StreamingText,
            turns: 0,
            tool_calls: 0,
            reply: String::new(),
        };

        outcome.state = loop {
            if outcome.turns >= self.settings.max_turns {
                tracing::warn!(max_turns = self.settings.max_turns, "turn limit reached");
                outcome.reply.push_str(LIMIT_MESSAGE);
                if emitter.text(LIMIT_MESSAGE).await.is_err() || emitter.done().await.is_err() {
                    break DriverState::Cancelled;
                }
                break DriverState::ToolLimitExceeded;
            }
            outcome.turns += 1;

            let turn = match self
                .stream_turn(&conversation, tools.clone(), emitter, &mut outcome.reply)
                .await
            {
                Ok(turn) => turn,
                Err(Interrupt::Upstream(e)) => {
                    tracing::error!(turn = outcome.turns, error = %e, "model request failed");
                    if emitter.error(format!("model request failed: {e}")).await.is_err() {
                        break DriverState::Cancelled;
                    }
                    break DriverState::UpstreamFailed;
                }
                Err(_) => break DriverState::Cancelled,
            };

            if request.mode == ChatMode::ChatOnly || turn.calls.is_empty() {
                if !turn.calls.is_empty() {
                    tracing::debug!(count = turn.calls.len(), "ignoring tool calls in chat-only mode");
                }
                if emitter.done().await.is_err() {
                    break DriverState::Cancelled;
                }
                break DriverState::Done;
            }

            // AwaitingTools
            let proposed = turn.calls.len();
            let mut calls: Vec<ToolCallRequest> = turn
                .calls
                .into_iter()
                .filter(|c| !c.name.trim().is_empty())
                .collect();
            if calls.len() < proposed {
                tracing::warn!(dropped = proposed - calls.len(), "skipping tool calls without a name");
            }
            let reassigned = assign_unique_ids(&mut calls);
            if reassigned > 0 {
                tracing::warn!(reassigned, "tool calls with blank or repeated ids given fresh ids");
            }
            if calls.is_empty() {
                tracing::error!(turn = outcome.turns, "no valid tool calls");
                if emitter.error(NO_VALID_CALLS_MESSAGE).await.is_err() {
                    break DriverState::Cancelled;
                }
                break DriverState::UpstreamFailed;
            }

            let text = (!turn.text.is_empty()).then_some(turn.text);
            conversation.push_assistant(text, calls.clone());

            // ExecutingTools
            let executed = if self.settings.parallel_tool_calls {
                self.execute_parallel(&calls, scope, emitter, &mut conversation).await
            } else {
                self.execute_sequential(&calls, scope, emitter, &mut conversation).await
            };
            outcome.tool_calls += executed.dispatched;

            match executed.interrupt {
                None => continue,
                Some(Interrupt::Internal) => {
                    if emitter.error(INTERNAL_MESSAGE).await.is_err() {
                        break DriverState::Cancelled;
                    }
                    break DriverState::InternalFailed;
                }
                Some(_) => break DriverState::Cancelled,
            }
        };

        tracing::info!(
            state = %outcome.state,
            turns = outcome.turns,
            tool_calls = outcome.tool_calls,
            "conversation finished"
        );
        Ok(outcome)
    }

    /// Stream one model turn, forwarding text. Races every wait against
    /// client disconnection.
    async fn stream_turn(
        &self,
        conversation: &Conversation,
        tools: Option<Vec<ToolDefinition>>,
        emitter: &mut StreamEmitter,
        reply: &mut String,
    ) -> Result<ModelTurn, Interrupt> {
        let messages = conversation.to_chat_messages();

        let mut stream = tokio::select! {
            biased;
            _ = emitter.closed() => return Err(Interrupt::Cancelled),
            started = self.model.stream_chat(messages, tools) => started.map_err(Interrupt::Upstream)?,
        };

        let mut turn = ModelTurn {
            text: String::new(),
            calls: Vec::new(),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = emitter.closed() => return Err(Interrupt::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(Interrupt::Upstream)?;

            if let Some(token) = chunk.token.filter(|t| !t.is_empty()) {
                emitter
                    .text(token.as_str())
                    .await
                    .map_err(|_| Interrupt::Cancelled)?;
                turn.text.push_str(&token);
                reply.push_str(&token);
            }
            if let Some(calls) = chunk.tool_calls {
                turn.calls.extend(calls);
            }
        }

        Ok(turn)
    }

    /// `A.started, A.finished, B.started, B.finished`. Stops starting new
    /// calls once the client is gone; a call already running completes.
    async fn execute_sequential(
        &self,
        calls: &[ToolCallRequest],
        scope: &ScopeKey,
        emitter: &mut StreamEmitter,
        conversation: &mut Conversation,
    ) -> Executed {
        let mut executed = Executed::default();

        for call in calls {
            if emitter.tool_status(&call.name, ToolState::Started).await.is_err() {
                return executed.interrupted(Interrupt::Cancelled);
            }
            let result = self.router.dispatch(call, scope).await;
            executed.dispatched += 1;

            if let Some(interrupt) = record(conversation, &result) {
                return executed.interrupted(interrupt);
            }
            if emitter.tool_status(&call.name, ToolState::Finished).await.is_err() {
                return executed.interrupted(Interrupt::Cancelled);
            }
            if result.error_kind() == Some(ToolErrorKind::InternalError) {
                return executed.interrupted(Interrupt::Internal);
            }
        }
        executed
    }

    /// `A.started, B.started, A.finished, B.finished`; results are folded
    /// in declaration order whatever order the calls complete in.
    async fn execute_parallel(
        &self,
        calls: &[ToolCallRequest],
        scope: &ScopeKey,
        emitter: &mut StreamEmitter,
        conversation: &mut Conversation,
    ) -> Executed {
        let mut executed = Executed::default();

        for call in calls {
            if emitter.tool_status(&call.name, ToolState::Started).await.is_err() {
                return executed.interrupted(Interrupt::Cancelled);
            }
        }

        let results = join_all(calls.iter().map(|call| self.router.dispatch(call, scope))).await;
        executed.dispatched = results.len();

        let mut internal = false;
        for result in &results {
            if let Some(interrupt) = record(conversation, result) {
                return executed.interrupted(interrupt);
            }
            if emitter.tool_status(&result.tool_name, ToolState::Finished).await.is_err() {
                return executed.interrupted(Interrupt::Cancelled);
            }
            internal |= result.error_kind() == Some(ToolErrorKind::InternalError);
        }

        if internal {
            return executed.interrupted(Interrupt::Internal);
        }
        executed
    }
}

#[derive(Default)]
struct Executed {
    dispatched: usize,
    interrupt: Option<Interrupt>,
}

impl Executed {
    fn interrupted(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }
}

/// Make every call id in one turn distinct. Blank and repeated ids get a
/// fresh `call_<uuid>`; the first occurrence keeps its id.
fn assign_unique_ids(calls: &mut [ToolCallRequest]) -> usize {
    let mut seen = HashSet::new();
    let mut reassigned = 0;
    for call in calls.iter_mut() {
        if call.id.trim().is_empty() || !seen.insert(call.id.clone()) {
            call.id = format!("call_{}", Uuid::new_v4().simple());
            seen.insert(call.id.clone());
            reassigned += 1;
        }
    }
    reassigned
}

/// Append a tool result; a broken ordering invariant is an internal failure.
fn record(conversation: &mut Conversation, result: &ToolResult) -> Option<Interrupt> {
    match conversation.push_tool_result(result) {
        Ok(()) => None,
        Err(e) => {
            tracing::error!(call_id = %result.call_id, error = %e, "could not record tool result");
            Some(Interrupt::Internal)
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::{json, Value};
    use tokio::sync::{mpsc, Notify};

    use super::*;
    use crate::agent_core::emitter;
    use crate::agent_core::operations::default_registry;
    use crate::agent_core::registry::{OperationRegistry, ToolSpec};
    use crate::agent_core::test_support::{
        call_tools, memory_backends, say, FakeHome, ScriptedModel, Turn,
    };
    use crate::agent_core::types::{Message, StreamEvent};
    use crate::agent_core::vocabulary::Vocabulary;
    use crate::inference::types::{Role, StreamChunk};
    use crate::stores::{Backends, GroceryStore, NewGroceryItem, TaskStore};

    struct Harness {
        driver: Arc<ConversationDriver>,
        model: Arc<ScriptedModel>,
        backends: Backends,
        home: Arc<FakeHome>,
    }

    fn harness_with(turns: Vec<Turn>, settings: DriverSettings, home: FakeHome) -> Harness {
        let home = Arc::new(home);
        let (_, backends) = memory_backends(home.clone());
        let registry = default_registry(&Vocabulary::default()).unwrap();
        harness_from(turns, settings, home, backends, registry)
    }

    fn harness_from(
        turns: Vec<Turn>,
        settings: DriverSettings,
        home: Arc<FakeHome>,
        backends: Backends,
        registry: OperationRegistry,
    ) -> Harness {
        let router = ToolRouter::new(
            Arc::new(registry),
            Arc::new(Vocabulary::default()),
            backends.clone(),
        );
        let model = Arc::new(ScriptedModel::new(turns));
        let driver = ConversationDriver::new(model.clone(), Arc::new(router), settings);
        Harness {
            driver: Arc::new(driver),
            model,
            backends,
            home,
        }
    }

    fn harness(turns: Vec<Turn>) -> Harness {
        harness_with(turns, DriverSettings::default(), FakeHome::default())
    }

    async fn run(h: &Harness, request: ChatRequest) -> (DriverOutcome, Vec<StreamEvent>) {
        let (mut emitter, mut rx) = emitter::channel(64);
        let outcome = h
            .driver
            .run(request, &ScopeKey::default(), &mut emitter)
            .await
            .unwrap();
        drop(emitter);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (outcome, events)
    }

    fn started(name: &str) -> StreamEvent {
        StreamEvent::ToolStatus {
            name: name.into(),
            state: ToolState::Started,
        }
    }

    fn finished(name: &str) -> StreamEvent {
        StreamEvent::ToolStatus {
            name: name.into(),
            state: ToolState::Finished,
        }
    }

    fn text(content: &str) -> StreamEvent {
        StreamEvent::TextDelta {
            content: content.into(),
        }
    }

    /// The JSON payload of the last tool message sent on model call `n`.
    fn last_tool_payload(model: &ScriptedModel, n: usize) -> Value {
        let call = &model.calls()[n];
        let msg = call
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        serde_json::from_str(msg.content.as_deref().unwrap()).unwrap()
    }

    async fn add_grocery(backends: &Backends, name: &str) -> String {
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
    async fn test_plain_answer() {
        let h = harness(vec![Turn::Chunks(vec![
            StreamChunk::text("Hello"),
            StreamChunk::text(" there"),
            StreamChunk::stop(),
        ])]);
        let (outcome, events) = run(&h, ChatRequest::new("hi")).await;

        assert_eq!(events, vec![text("Hello"), text(" there"), StreamEvent::Done]);
        assert_eq!(outcome.state, DriverState::Done);
        assert_eq!(outcome.reply, "Hello there");
        assert_eq!(outcome.turns, 1);

        let calls = h.model.calls();
        assert_eq!(calls[0].messages[0].role, Role::System);
        assert_eq!(calls[0].messages[1].content.as_deref(), Some("hi"));
        assert_eq!(calls[0].tools.as_ref().unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_ordinal_grocery_update() {
        let h = harness(vec![
            call_tools(&[(
                "call_1",
                "update_grocery_status",
                json!({ "id": "2", "status": "Ordered" }),
            )]),
            say("Marked eggs as purchased."),
        ]);
        add_grocery(&h.backends, "milk").await;
        let eggs = add_grocery(&h.backends, "eggs").await;

        let (outcome, events) = run(&h, ChatRequest::new("mark the second one as ordered")).await;

        assert_eq!(
            events,
            vec![
                started("update_grocery_status"),
                finished("update_grocery_status"),
                text("Marked eggs as purchased."),
                StreamEvent::Done,
            ]
        );
        assert_eq!(outcome.state, DriverState::Done);
        assert_eq!(outcome.tool_calls, 1);

        let payload = last_tool_payload(&h.model, 1);
        assert_eq!(payload["ok"], true);
        assert_eq!(payload["result"]["item"]["id"], eggs);

        let items = h
            .backends
            .groceries
            .list_groceries(&ScopeKey::default(), None, 10)
            .await
            .unwrap();
        assert_eq!(items[0].status.as_str(), "not_purchased");
        assert_eq!(items[1].status.as_str(), "purchased");
    }

    #[tokio::test]
    async fn test_ordinal_on_empty_list_is_reported_to_model() {
        let h = harness(vec![
            call_tools(&[("call_1", "update_task_status", json!({ "id": "1", "status": "done" }))]),
            say("You don't have any tasks yet."),
        ]);
        let (outcome, events) = run(&h, ChatRequest::new("finish my first task")).await;

        assert_eq!(outcome.state, DriverState::Done);
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));

        let payload = last_tool_payload(&h.model, 1);
        assert_eq!(payload["ok"], false);
        assert_eq!(payload["error_kind"], "not_found");
        assert_eq!(payload["details"]["index"], 1);
        assert_eq!(payload["details"]["length"], 0);
    }

    #[tokio::test]
    async fn test_unmapped_status_reaches_model_and_store_is_untouched() {
        let h = harness(vec![
            call_tools(&[(
                "call_1",
                "update_grocery_status",
                json!({ "id": "1", "status": "Shipped" }),
            )]),
            say("I can mark items as needed or purchased."),
        ]);
        add_grocery(&h.backends, "milk").await;

        let (outcome, _) = run(&h, ChatRequest::new("mark milk as shipped")).await;
        assert_eq!(outcome.state, DriverState::Done);

        let payload = last_tool_payload(&h.model, 1);
        assert_eq!(payload["error_kind"], "validation_error");
        assert_eq!(payload["details"]["token"], "Shipped");
        assert_eq!(payload["details"]["resource_kind"], "grocery");

        let items = h
            .backends
            .groceries
            .list_groceries(&ScopeKey::default(), None, 10)
            .await
            .unwrap();
        assert_eq!(items[0].status.as_str(), "not_purchased");
    }

    #[tokio::test]
    async fn test_chat_only_offers_no_tools_and_ignores_calls() {
        let h = harness(vec![Turn::Chunks(vec![
            StreamChunk::text("Sure."),
            StreamChunk::calls(vec![ToolCallRequest {
                id: "call_1".into(),
                name: "create_task".into(),
                raw_arguments: json!({ "title": "x", "due": "2025-01-01T00:00:00Z" }).to_string(),
            }]),
        ])]);
        let (outcome, events) = run(
            &h,
            ChatRequest::new("add a task").with_mode(ChatMode::ChatOnly),
        )
        .await;

        assert_eq!(events, vec![text("Sure."), StreamEvent::Done]);
        assert_eq!(outcome.state, DriverState::Done);
        assert_eq!(outcome.tool_calls, 0);
        assert!(h.model.calls()[0].tools.is_none());
        assert_eq!(h.model.call_count(), 1);

        let tasks = h
            .backends
            .tasks
            .list_tasks(&ScopeKey::default(), None, 10)
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_turn_limit_ends_with_explanation_then_done() {
        let settings = DriverSettings {
            max_turns: 2,
            ..DriverSettings::default()
        };
        let h = harness_with(
            vec![
                call_tools(&[("c1", "list_tasks", json!({}))]),
                call_tools(&[("c2", "list_tasks", json!({}))]),
                say("never reached"),
            ],
            settings,
            FakeHome::default(),
        );
        let (outcome, events) = run(&h, ChatRequest::new("loop forever")).await;

        assert_eq!(outcome.state, DriverState::ToolLimitExceeded);
        assert_eq!(h.model.call_count(), 2);
        assert_eq!(
            events,
            vec![
                started("list_tasks"),
                finished("list_tasks"),
                started("list_tasks"),
                finished("list_tasks"),
                text(LIMIT_MESSAGE),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_model_failure_emits_error_without_done() {
        let h = harness(vec![Turn::Fail(InferenceError::ConnectionFailed {
            endpoint: "http://localhost:1".into(),
            reason: "refused".into(),
        })]);
        let (outcome, events) = run(&h, ChatRequest::new("hi")).await;

        assert_eq!(outcome.state, DriverState::UpstreamFailed);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_stream_broken_mid_turn() {
        let h = harness(vec![Turn::FailMidStream(
            vec![StreamChunk::text("Let me")],
            InferenceError::StreamError {
                reason: "connection reset".into(),
            },
        )]);
        let (outcome, events) = run(&h, ChatRequest::new("hi")).await;

        assert_eq!(outcome.state, DriverState::UpstreamFailed);
        assert_eq!(events[0], text("Let me"));
        assert!(matches!(events[1], StreamEvent::Error { .. }));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_nameless_calls_only_is_an_error() {
        let h = harness(vec![call_tools(&[("c1", "", json!({}))])]);
        let (outcome, events) = run(&h, ChatRequest::new("hi")).await;

        assert_eq!(outcome.state, DriverState::UpstreamFailed);
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                error: NO_VALID_CALLS_MESSAGE.into()
            }]
        );
    }

    #[tokio::test]
    async fn test_nameless_calls_are_dropped() {
        let h = harness(vec![
            call_tools(&[("c1", "", json!({})), ("c2", "list_tasks", json!({}))]),
            say("No tasks."),
        ]);
        let (outcome, events) = run(&h, ChatRequest::new("tasks?")).await;

        assert_eq!(outcome.state, DriverState::Done);
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(events[0], started("list_tasks"));
    }

    #[tokio::test]
    async fn test_repeated_call_ids_run_once_each() {
        let h = harness(vec![
            call_tools(&[
                ("dup", "create_task", json!({ "title": "a", "due": "2026-01-01T09:00:00Z" })),
                ("dup", "create_task", json!({ "title": "b", "due": "2026-01-02T09:00:00Z" })),
            ]),
            say("Created both."),
        ]);
        let (outcome, events) = run(&h, ChatRequest::new("two tasks")).await;

        assert_eq!(outcome.state, DriverState::Done);
        assert_eq!(
            events,
            vec![
                started("create_task"),
                finished("create_task"),
                started("create_task"),
                finished("create_task"),
                text("Created both."),
                StreamEvent::Done,
            ]
        );

        let tasks = h
            .backends
            .tasks
            .list_tasks(&ScopeKey::default(), None, 10)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);

        let second = &h.model.calls()[1].messages;
        let ids: Vec<_> = second
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], "dup");
        assert!(ids[1].starts_with("call_"));
    }

    #[test]
    fn test_assign_unique_ids() {
        let call = |id: &str| ToolCallRequest {
            id: id.into(),
            name: "list_tasks".into(),
            raw_arguments: "{}".into(),
        };
        let mut calls = vec![call("a"), call(""), call("a"), call("b")];
        assert_eq!(assign_unique_ids(&mut calls), 2);

        let ids: HashSet<_> = calls.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[3].id, "b");
    }

    #[tokio::test]
    async fn test_sequential_status_order() {
        let h = harness(vec![
            call_tools(&[
                ("a", "list_tasks", json!({})),
                ("b", "list_groceries", json!({})),
            ]),
            say("ok"),
        ]);
        let (_, events) = run(&h, ChatRequest::new("everything")).await;
        assert_eq!(
            &events[..4],
            &[
                started("list_tasks"),
                finished("list_tasks"),
                started("list_groceries"),
                finished("list_groceries"),
            ]
        );

        let second = &h.model.calls()[1].messages;
        let ids: Vec<_> = second
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_parallel_status_order() {
        let settings = DriverSettings {
            parallel_tool_calls: true,
            ..DriverSettings::default()
        };
        let h = harness_with(
            vec![
                call_tools(&[
                    ("a", "list_tasks", json!({})),
                    ("b", "list_groceries", json!({})),
                ]),
                say("ok"),
            ],
            settings,
            FakeHome::default(),
        );
        let (outcome, events) = run(&h, ChatRequest::new("everything")).await;

        assert_eq!(outcome.tool_calls, 2);
        assert_eq!(
            &events[..4],
            &[
                started("list_tasks"),
                started("list_groceries"),
                finished("list_tasks"),
                finished("list_groceries"),
            ]
        );
    }

    #[derive(Deserialize)]
    struct NoArgs {}

    #[tokio::test]
    async fn test_internal_error_terminates_request() {
        let mut registry = OperationRegistry::new();
        registry
            .register(ToolSpec::new("explode", "Always panics.", vec![], |_: NoArgs, _ctx| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            }))
            .unwrap();
        let home = Arc::new(FakeHome::default());
        let (_, backends) = memory_backends(home.clone());
        let h = harness_from(
            vec![call_tools(&[("c1", "explode", json!({}))]), say("unreachable")],
            DriverSettings::default(),
            home,
            backends,
            registry,
        );

        let (outcome, events) = run(&h, ChatRequest::new("boom")).await;
        assert_eq!(outcome.state, DriverState::InternalFailed);
        assert_eq!(h.model.call_count(), 1);
        assert_eq!(
            events,
            vec![
                started("explode"),
                finished("explode"),
                StreamEvent::Error {
                    error: INTERNAL_MESSAGE.into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_history_is_rejected_before_any_event() {
        let h = harness(vec![say("unused")]);
        let (mut emitter, mut rx) = emitter::channel(8);
        let request = ChatRequest::new("hi").with_history(vec![Message::tool("nope", "{}")]);

        let err = h
            .driver
            .run(request, &ScopeKey::default(), &mut emitter)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidHistory { .. }));
        assert_eq!(h.model.call_count(), 0);
        drop(emitter);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_history_precedes_prompt() {
        let h = harness(vec![say("Milk and eggs.")]);
        let history = vec![
            Message::user("add milk"),
            Message::assistant(Some("Added milk.".into()), vec![]),
        ];
        run(&h, ChatRequest::new("what did I add?").with_history(history)).await;

        let messages = &h.model.calls()[0].messages;
        let contents: Vec<_> = messages.iter().map(|m| m.content.clone().unwrap_or_default()).collect();
        assert_eq!(contents[1], "add milk");
        assert_eq!(contents[2], "Added milk.");
        assert_eq!(contents[3], "what did I add?");
    }

    #[tokio::test]
    async fn test_disconnect_during_tool_execution_stops_further_work() {
        let gate = Arc::new(Notify::new());
        let h = harness_with(
            vec![
                call_tools(&[
                    ("c1", "ha_service_call", json!({ "domain": "light", "service": "turn_on" })),
                    ("c2", "ha_service_call", json!({ "domain": "light", "service": "turn_off" })),
                ]),
                say("never reached"),
            ],
            DriverSettings::default(),
            FakeHome::gated(gate.clone()),
        );

        let (mut emitter, mut rx): (StreamEmitter, mpsc::Receiver<StreamEvent>) =
            emitter::channel(64);
        let driver = h.driver.clone();
        let task = tokio::spawn(async move {
            driver
                .run(ChatRequest::new("lights"), &ScopeKey::default(), &mut emitter)
                .await
        });

        assert_eq!(rx.recv().await, Some(started("ha_service_call")));
        h.home.entered.notified().await;
        drop(rx);
        gate.notify_one();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.state, DriverState::Cancelled);
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(h.home.calls().len(), 1, "second call must never start");
        assert_eq!(h.model.call_count(), 1, "model must not be re-invoked");
    }
}
