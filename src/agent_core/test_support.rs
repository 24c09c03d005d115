//! Fakes shared by the agent core tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::inference::errors::InferenceError;
use crate::inference::model::{ChatModel, ChunkStream};
use crate::inference::types::{ChatMessage, StreamChunk, ToolCallRequest, ToolDefinition};
use crate::stores::home_assistant::ServiceCall;
use crate::stores::sqlite::SqliteStore;
use crate::stores::{Backends, HomeAutomation, ResourceKind, ResourceListing, ScopeKey, StoreError};

// ─── Model ──────────────────────────────────────────────────────────────────

/// One scripted model turn.
pub enum Turn {
    Chunks(Vec<StreamChunk>),
    /// `stream_chat` itself fails.
    Fail(InferenceError),
    /// The stream yields these chunks and then an error.
    FailMidStream(Vec<StreamChunk>, InferenceError),
}

/// A recorded `stream_chat` call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<ChatMessage>,
    pub tools: Option<Vec<ToolDefinition>>,
}

/// A model that replays queued turns and records every call.
#[derive(Default)]
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Turn>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChunkStream, InferenceError> {
        self.calls.lock().unwrap().push(RecordedCall { messages, tools });

        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Turn::Chunks(vec![StreamChunk::text("(script exhausted)"), StreamChunk::stop()]));

        match turn {
            Turn::Chunks(chunks) => Ok(stream::iter(chunks.into_iter().map(Ok)).boxed()),
            Turn::Fail(e) => Err(e),
            Turn::FailMidStream(chunks, e) => Ok(stream::iter(
                chunks.into_iter().map(Ok).chain(std::iter::once(Err(e))),
            )
            .boxed()),
        }
    }
}

/// A text-only turn.
pub fn say(text: &str) -> Turn {
    Turn::Chunks(vec![StreamChunk::text(text), StreamChunk::stop()])
}

/// A turn proposing tool calls, given as `(id, name, arguments)`.
pub fn call_tools(calls: &[(&str, &str, Value)]) -> Turn {
    Turn::Chunks(vec![StreamChunk::calls(
        calls
            .iter()
            .map(|(id, name, args)| ToolCallRequest {
                id: id.to_string(),
                name: name.to_string(),
                raw_arguments: args.to_string(),
            })
            .collect(),
    )])
}

// ─── Listing ────────────────────────────────────────────────────────────────

/// Fixed listings that count how often they are fetched.
#[derive(Default)]
pub struct FakeListing {
    ids: HashMap<ResourceKind, Vec<String>>,
    fetches: AtomicUsize,
    fail: bool,
}

impl FakeListing {
    pub fn with(kind: ResourceKind, ids: &[&str]) -> Self {
        let mut listing = Self::default();
        listing
            .ids
            .insert(kind, ids.iter().map(|s| s.to_string()).collect());
        listing
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceListing for FakeListing {
    async fn list_ordered_ids(
        &self,
        kind: ResourceKind,
        _scope: &ScopeKey,
    ) -> Result<Vec<String>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(StoreError::Database {
                reason: "listing unavailable".into(),
            });
        }
        Ok(self.ids.get(&kind).cloned().unwrap_or_default())
    }
}

// ─── Home Automation ────────────────────────────────────────────────────────

/// Records service calls; optionally parks each call until released.
#[derive(Default)]
pub struct FakeHome {
    calls: Mutex<Vec<ServiceCall>>,
    gate: Option<Arc<Notify>>,
    /// Signalled once a call has entered the handler.
    pub entered: Arc<Notify>,
}

impl FakeHome {
    /// Every call waits on `gate` before completing.
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HomeAutomation for FakeHome {
    async fn call_service(&self, call: ServiceCall) -> Result<Value, StoreError> {
        self.calls.lock().unwrap().push(call.clone());
        self.entered.notify_one();
        if let Some(ref gate) = self.gate {
            gate.notified().await;
        }
        Ok(json!({ "ok": true, "called": call.qualified_name() }))
    }
}

/// In-memory SQLite backends with the given home automation fake.
pub fn memory_backends(home: Arc<FakeHome>) -> (Arc<SqliteStore>, Backends) {
    let store = Arc::new(SqliteStore::open(":memory:").unwrap());
    let backends = Backends::local(store.clone(), home);
    (store, backends)
}
