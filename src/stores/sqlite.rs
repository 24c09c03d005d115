//! SQLite-backed local store for groceries, tasks and calendar events.
//!
//! `rusqlite` is synchronous: every trait method moves its statements onto
//! tokio's blocking pool and holds the connection lock only there.
//! WAL mode is enabled so readers do not block the writer.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{
    CalendarEvent, CalendarStore, GroceryItem, GroceryStatus, GroceryStore, NewCalendarEvent,
    NewGroceryItem, NewTask, ResourceKind, ResourceListing, ScopeKey, StoreError, Task,
    TaskStatus, TaskStore,
};

// ─── Store ──────────────────────────────────────────────────────────────────

/// Local SQLite store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        create_tables(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|e| StoreError::Database {
                reason: format!("connection lock poisoned: {e}"),
            })?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Database {
            reason: format!("database task failed: {e}"),
        })?
    }
}

fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS groceries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            scope TEXT NOT NULL,
            name TEXT NOT NULL,
            qty INTEGER NOT NULL DEFAULT 1,
            notes TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_groceries_scope
            ON groceries(scope, created_at, seq);

        CREATE TABLE IF NOT EXISTS tasks (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            scope TEXT NOT NULL,
            title TEXT NOT NULL,
            due TEXT NOT NULL,
            context TEXT NOT NULL,
            priority TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_scope
            ON tasks(scope, created_at, seq);

        CREATE TABLE IF NOT EXISTS calendar_events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            scope TEXT NOT NULL,
            title TEXT NOT NULL,
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            description TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_scope
            ON calendar_events(scope, start_at);
        ",
    )?;
    Ok(())
}

// ─── Groceries ──────────────────────────────────────────────────────────────

fn get_grocery(conn: &Connection, scope: &str, id: &str) -> Result<Option<GroceryItem>, StoreError> {
    let item = conn
        .query_row(
            "SELECT id, name, qty, notes, status, created_at
             FROM groceries WHERE id = ?1 AND scope = ?2",
            params![id, scope],
            grocery_from_row,
        )
        .optional()?;
    Ok(item)
}

#[async_trait]
impl GroceryStore for SqliteStore {
    async fn add_grocery(
        &self,
        scope: &ScopeKey,
        item: NewGroceryItem,
    ) -> Result<GroceryItem, StoreError> {
        let record = GroceryItem {
            id: Uuid::new_v4().to_string(),
            name: item.name,
            qty: item.qty,
            notes: item.notes,
            status: GroceryStatus::NotPurchased,
            created_at: Utc::now(),
        };

        let row = record.clone();
        let scope_key = scope.as_str().to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO groceries (id, scope, name, qty, notes, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    scope_key,
                    row.name,
                    row.qty,
                    row.notes,
                    row.status.as_str(),
                    format_timestamp(&row.created_at),
                ],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(id = %record.id, scope = %scope, "grocery item created");
        Ok(record)
    }

    async fn list_groceries(
        &self,
        scope: &ScopeKey,
        status: Option<GroceryStatus>,
        limit: usize,
    ) -> Result<Vec<GroceryItem>, StoreError> {
        let scope = scope.as_str().to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, qty, notes, status, created_at
                 FROM groceries
                 WHERE scope = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at ASC, seq ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![scope, status.map(|s| s.as_str()), limit as i64],
                grocery_from_row,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn set_grocery_status(
        &self,
        scope: &ScopeKey,
        id: &str,
        status: GroceryStatus,
    ) -> Result<GroceryItem, StoreError> {
        let scope = scope.as_str().to_string();
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE groceries SET status = ?1 WHERE id = ?2 AND scope = ?3",
                params![status.as_str(), id, scope],
            )?;
            let updated = if changed == 0 {
                None
            } else {
                get_grocery(conn, &scope, &id)?
            };
            updated.ok_or(StoreError::NotFound {
                kind: ResourceKind::Grocery,
                id,
            })
        })
        .await
    }
}

// ─── Tasks ──────────────────────────────────────────────────────────────────

fn get_task(conn: &Connection, scope: &str, id: &str) -> Result<Option<Task>, StoreError> {
    let task = conn
        .query_row(
            "SELECT id, title, due, context, priority, status, created_at
             FROM tasks WHERE id = ?1 AND scope = ?2",
            params![id, scope],
            task_from_row,
        )
        .optional()?;
    Ok(task)
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_task(&self, scope: &ScopeKey, task: NewTask) -> Result<Task, StoreError> {
        let record = Task {
            id: Uuid::new_v4().to_string(),
            title: task.title,
            due: task.due,
            context: task.context,
            priority: task.priority,
            status: TaskStatus::Todo,
            created_at: Utc::now(),
        };

        let row = record.clone();
        let scope_key = scope.as_str().to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, scope, title, due, context, priority, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.id,
                    scope_key,
                    row.title,
                    format_timestamp(&row.due),
                    row.context,
                    row.priority.as_str(),
                    row.status.as_str(),
                    format_timestamp(&row.created_at),
                ],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(id = %record.id, scope = %scope, "task created");
        Ok(record)
    }

    async fn list_tasks(
        &self,
        scope: &ScopeKey,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let scope = scope.as_str().to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, due, context, priority, status, created_at
                 FROM tasks
                 WHERE scope = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at ASC, seq ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![scope, status.map(|s| s.as_str()), limit as i64],
                task_from_row,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn set_task_status(
        &self,
        scope: &ScopeKey,
        id: &str,
        status: TaskStatus,
    ) -> Result<Task, StoreError> {
        let scope = scope.as_str().to_string();
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = ?1 WHERE id = ?2 AND scope = ?3",
                params![status.as_str(), id, scope],
            )?;
            let updated = if changed == 0 {
                None
            } else {
                get_task(conn, &scope, &id)?
            };
            updated.ok_or(StoreError::NotFound {
                kind: ResourceKind::Task,
                id,
            })
        })
        .await
    }
}

// ─── Calendar ───────────────────────────────────────────────────────────────

#[async_trait]
impl CalendarStore for SqliteStore {
    async fn create_event(
        &self,
        scope: &ScopeKey,
        event: NewCalendarEvent,
    ) -> Result<CalendarEvent, StoreError> {
        let record = CalendarEvent {
            id: Uuid::new_v4().to_string(),
            title: event.title,
            start: event.start,
            end: event.end,
            description: event.description,
            created_at: Utc::now(),
        };

        let row = record.clone();
        let scope_key = scope.as_str().to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO calendar_events (id, scope, title, start_at, end_at, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    scope_key,
                    row.title,
                    format_timestamp(&row.start),
                    format_timestamp(&row.end),
                    row.description,
                    format_timestamp(&row.created_at),
                ],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(id = %record.id, scope = %scope, "calendar event created");
        Ok(record)
    }

    async fn list_events(
        &self,
        scope: &ScopeKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        max_results: usize,
    ) -> Result<Vec<CalendarEvent>, StoreError> {
        let scope = scope.as_str().to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, start_at, end_at, description, created_at
                 FROM calendar_events
                 WHERE scope = ?1 AND start_at >= ?2 AND start_at <= ?3
                 ORDER BY start_at ASC, seq ASC
                 LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![
                    scope,
                    format_timestamp(&from),
                    format_timestamp(&to),
                    max_results as i64
                ],
                event_from_row,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

#[async_trait]
impl ResourceListing for SqliteStore {
    async fn list_ordered_ids(
        &self,
        kind: ResourceKind,
        scope: &ScopeKey,
    ) -> Result<Vec<String>, StoreError> {
        let sql = match kind {
            ResourceKind::Grocery => {
                "SELECT id FROM groceries WHERE scope = ?1 ORDER BY created_at ASC, seq ASC"
            }
            ResourceKind::Task => {
                "SELECT id FROM tasks WHERE scope = ?1 ORDER BY created_at ASC, seq ASC"
            }
            ResourceKind::CalendarEvent => {
                "SELECT id FROM calendar_events WHERE scope = ?1 ORDER BY created_at ASC, seq ASC"
            }
        };

        let scope = scope.as_str().to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![scope], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

// ─── Row Mapping ────────────────────────────────────────────────────────────

/// Fixed-width UTC timestamps so lexical order equals chronological order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = StoreError>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn grocery_from_row(row: &Row<'_>) -> rusqlite::Result<GroceryItem> {
    Ok(GroceryItem {
        id: row.get(0)?,
        name: row.get(1)?,
        qty: row.get(2)?,
        notes: row.get(3)?,
        status: parsed_col(row, 4)?,
        created_at: timestamp_col(row, 5)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        due: timestamp_col(row, 2)?,
        context: row.get(3)?,
        priority: parsed_col(row, 4)?,
        status: parsed_col(row, 5)?,
        created_at: timestamp_col(row, 6)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<CalendarEvent> {
    Ok(CalendarEvent {
        id: row.get(0)?,
        title: row.get(1)?,
        start: timestamp_col(row, 2)?,
        end: timestamp_col(row, 3)?,
        description: row.get(4)?,
        created_at: timestamp_col(row, 5)?,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
