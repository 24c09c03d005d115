//! Stores: user-data collaborators the tools act on.
//!
//! Each resource family (groceries, tasks, calendar events) sits behind an
//! async trait so the dispatcher never knows which backend is in use.
//! `SqliteStore` implements all of them locally; `HomeAssistantClient` talks to
//! a Home Assistant instance over REST.
//!
//! Listing contract: every `list_*` method and `ResourceListing` return rows in
//! creation order (oldest first, ties broken by insertion order). Ordinal
//! references ("item 2") are resolved against exactly this order.

pub mod home_assistant;
pub mod sqlite;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use home_assistant::{HomeAssistantClient, ServiceCall};
pub use sqlite::SqliteStore;

/// Scope used when the client does not identify a user.
pub const DEFAULT_SCOPE: &str = "default-user";

// ─── Keys & Kinds ───────────────────────────────────────────────────────────

/// The caller scope that listings and updates are confined to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ScopeKey {
    fn default() -> Self {
        Self(DEFAULT_SCOPE.to_string())
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource families addressable by reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Grocery,
    Task,
    CalendarEvent,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Grocery => "grocery",
            ResourceKind::Task => "task",
            ResourceKind::CalendarEvent => "calendar_event",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Canonical Statuses ─────────────────────────────────────────────────────

/// Canonical grocery item status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroceryStatus {
    NotPurchased,
    Purchased,
}

impl GroceryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroceryStatus::NotPurchased => "not_purchased",
            GroceryStatus::Purchased => "purchased",
        }
    }
}

impl FromStr for GroceryStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_purchased" => Ok(GroceryStatus::NotPurchased),
            "purchased" => Ok(GroceryStatus::Purchased),
            other => Err(StoreError::InvalidData {
                reason: format!("unknown grocery status '{other}'"),
            }),
        }
    }
}

/// Canonical task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
    Archived,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Archived => "archived",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "archived" => Ok(TaskStatus::Archived),
            other => Err(StoreError::InvalidData {
                reason: format!("unknown task status '{other}'"),
            }),
        }
    }
}

/// A status value in the canonical enumeration of one resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalStatus {
    Grocery(GroceryStatus),
    Task(TaskStatus),
}

impl CanonicalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::Grocery(s) => s.as_str(),
            CanonicalStatus::Task(s) => s.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPriority {
    Low,
    Med,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "Low",
            TaskPriority::Med => "Med",
            TaskPriority::High => "High",
        }
    }
}

impl FromStr for TaskPriority {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Low" => Ok(TaskPriority::Low),
            "Med" => Ok(TaskPriority::Med),
            "High" => Ok(TaskPriority::High),
            other => Err(StoreError::InvalidData {
                reason: format!("unknown task priority '{other}'"),
            }),
        }
    }
}

// ─── Records ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroceryItem {
    pub id: String,
    pub name: String,
    pub qty: u32,
    pub notes: Option<String>,
    pub status: GroceryStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewGroceryItem {
    pub name: String,
    pub qty: u32,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub due: DateTime<Utc>,
    pub context: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub due: DateTime<Utc>,
    pub context: String,
    pub priority: TaskPriority,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCalendarEvent {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub description: Option<String>,
}

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Errors raised by store collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row with this id exists within the caller's scope.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: ResourceKind, id: String },

    /// Local database failure.
    #[error("database error: {reason}")]
    Database { reason: String },

    /// A remote service failed or is not configured.
    #[error("{service} error: {reason}")]
    Upstream { service: String, reason: String },

    /// A stored value could not be decoded.
    #[error("invalid stored data: {reason}")]
    InvalidData { reason: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database {
            reason: e.to_string(),
        }
    }
}

// ─── Traits ─────────────────────────────────────────────────────────────────

/// Ordered id listing used to resolve ordinal references.
#[async_trait]
pub trait ResourceListing: Send + Sync {
    /// Ids of every `kind` row in `scope`, in creation order.
    async fn list_ordered_ids(
        &self,
        kind: ResourceKind,
        scope: &ScopeKey,
    ) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait GroceryStore: Send + Sync {
    async fn add_grocery(
        &self,
        scope: &ScopeKey,
        item: NewGroceryItem,
    ) -> Result<GroceryItem, StoreError>;

    async fn list_groceries(
        &self,
        scope: &ScopeKey,
        status: Option<GroceryStatus>,
        limit: usize,
    ) -> Result<Vec<GroceryItem>, StoreError>;

    async fn set_grocery_status(
        &self,
        scope: &ScopeKey,
        id: &str,
        status: GroceryStatus,
    ) -> Result<GroceryItem, StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, scope: &ScopeKey, task: NewTask) -> Result<Task, StoreError>;

    async fn list_tasks(
        &self,
        scope: &ScopeKey,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    async fn set_task_status(
        &self,
        scope: &ScopeKey,
        id: &str,
        status: TaskStatus,
    ) -> Result<Task, StoreError>;
}

#[async_trait]
pub trait CalendarStore: Send + Sync {
    async fn create_event(
        &self,
        scope: &ScopeKey,
        event: NewCalendarEvent,
    ) -> Result<CalendarEvent, StoreError>;

    /// Events starting within `[from, to]`, ordered by start time.
    async fn list_events(
        &self,
        scope: &ScopeKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        max_results: usize,
    ) -> Result<Vec<CalendarEvent>, StoreError>;
}

/// Smart-home service invocation.
#[async_trait]
pub trait HomeAutomation: Send + Sync {
    async fn call_service(&self, call: ServiceCall) -> Result<serde_json::Value, StoreError>;
}

// ─── Backends ───────────────────────────────────────────────────────────────

/// The set of collaborators handed to tool handlers.
#[derive(Clone)]
pub struct Backends {
    pub groceries: Arc<dyn GroceryStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub calendar: Arc<dyn CalendarStore>,
    pub listing: Arc<dyn ResourceListing>,
    pub home: Arc<dyn HomeAutomation>,
}

impl Backends {
    /// Wire every local store to one SQLite handle.
    pub fn local(store: Arc<SqliteStore>, home: Arc<dyn HomeAutomation>) -> Self {
        Self {
            groceries: store.clone(),
            tasks: store.clone(),
            calendar: store.clone(),
            listing: store,
            home,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
