//! The personal-assistant operations: groceries, tasks, calendar and
//! Home Assistant.
//!
//! Handlers receive arguments that have already been validated, with
//! resource references resolved to canonical ids and status words
//! normalized to canonical values.
//!
//! Listing outputs carry both `idx` (1-based position in the creation-ordered
//! list of the caller's scope, the same numbering ordinal references use)
//! and `id`.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::stores::home_assistant::ServiceCall;
use crate::stores::{
    CalendarEvent, GroceryItem, GroceryStatus, NewCalendarEvent, NewGroceryItem, NewTask,
    ResourceKind, Task, TaskPriority, TaskStatus,
};

use super::errors::{AgentError, ToolError};
use super::registry::{OperationRegistry, ParamSpec, ToolContext, ToolSpec};
use super::vocabulary::Vocabulary;

/// Default system prompt.
pub const SYSTEM_PROMPT: &str = "\
You are a helpful personal AI assistant with access to tools for managing:
- Grocery lists (add_to_groceries, list_groceries, update_grocery_status)
- Tasks (create_task, list_tasks, update_task_status)
- Calendar events (create_event, list_calendar_events)
- Home automation (ha_service_call) - control Home Assistant devices and services

Items in lists are numbered by `idx`, starting at 1. When the user refers to \
\"the second task\" or \"item 3\", pass that number as the id; you may also pass \
the `id` value exactly as returned. Timestamps are RFC 3339.

When users request these actions, use the appropriate tools with the correct \
parameters. After tool execution completes, confirm what was done in a natural, \
conversational way. Be specific about what was created or updated. If a tool \
reports an error, explain it and ask the user how to proceed.";

// ─── Registry ───────────────────────────────────────────────────────────────

/// Build the registry of every operation. Status argument descriptions list
/// the words `vocabulary` accepts.
pub fn default_registry(vocabulary: &Vocabulary) -> Result<OperationRegistry, AgentError> {
    let grocery_words = vocabulary.words(ResourceKind::Grocery).join(", ");
    let task_words = vocabulary.words(ResourceKind::Task).join(", ");

    let mut registry = OperationRegistry::new();

    registry.register(ToolSpec::new(
        "add_to_groceries",
        "Add an item to the grocery list.",
        vec![
            ParamSpec::string("item").required().describe("Item name, e.g. 'milk'"),
            ParamSpec::integer("qty", 1, 1000).describe("Quantity (default 1)"),
            ParamSpec::string("notes").describe("Optional notes such as brand or size"),
        ],
        add_to_groceries,
    ))?;

    registry.register(ToolSpec::new(
        "list_groceries",
        "List grocery items with optional status filter. Returns items with both idx \
         (1-based position for references like 'item 1') and id.",
        vec![
            ParamSpec::status_token("status", ResourceKind::Grocery)
                .describe(format!("Only items with this status: {grocery_words}")),
            ParamSpec::integer("limit", 1, 500).describe("Maximum items (default 100)"),
        ],
        list_groceries,
    ))?;

    registry.register(ToolSpec::new(
        "update_grocery_status",
        "Change the status of a grocery item.",
        vec![
            ParamSpec::resource_ref("id", ResourceKind::Grocery)
                .required()
                .describe("List position (1 = first item) or id"),
            ParamSpec::status_token("status", ResourceKind::Grocery)
                .required()
                .describe(format!("New status: {grocery_words}")),
        ],
        update_grocery_status,
    ))?;

    registry.register(ToolSpec::new(
        "create_task",
        "Create a task with a due date.",
        vec![
            ParamSpec::string("title").required(),
            ParamSpec::datetime("due").required().describe("Due date-time (RFC 3339)"),
            ParamSpec::string("context").describe("Where the task belongs (default 'Home')"),
            ParamSpec::one_of("priority", &["Low", "Med", "High"])
                .describe("Priority (default 'Med')"),
        ],
        create_task,
    ))?;

    registry.register(ToolSpec::new(
        "list_tasks",
        "List tasks with optional status filter. Returns tasks with both idx \
         (1-based position for references like 'task 1') and id.",
        vec![
            ParamSpec::status_token("status", ResourceKind::Task)
                .describe(format!("Only tasks with this status: {task_words}")),
            ParamSpec::integer("limit", 1, 250).describe("Maximum tasks (default 50)"),
        ],
        list_tasks,
    ))?;

    registry.register(ToolSpec::new(
        "update_task_status",
        "Change the status of a task.",
        vec![
            ParamSpec::resource_ref("id", ResourceKind::Task)
                .required()
                .describe("List position (1 = first task) or id"),
            ParamSpec::status_token("status", ResourceKind::Task)
                .required()
                .describe(format!("New status: {task_words}")),
        ],
        update_task_status,
    ))?;

    registry.register(ToolSpec::new(
        "create_event",
        "Create a calendar event.",
        vec![
            ParamSpec::string("title").required(),
            ParamSpec::datetime("start").required(),
            ParamSpec::datetime("end").required(),
            ParamSpec::string("description"),
        ],
        create_event,
    ))?;

    registry.register(ToolSpec::new(
        "list_calendar_events",
        "List calendar events starting within a window (default: the next 7 days).",
        vec![
            ParamSpec::datetime("from_dt").describe("Window start (default now)"),
            ParamSpec::datetime("to_dt").describe("Window end (default from_dt + 7 days)"),
            ParamSpec::integer("max_results", 1, 250).describe("Maximum events (default 50)"),
        ],
        list_calendar_events,
    ))?;

    registry.register(ToolSpec::new(
        "ha_service_call",
        "Call a Home Assistant service, e.g. domain 'light', service 'turn_on'.",
        vec![
            ParamSpec::string("domain").required(),
            ParamSpec::string("service").required(),
            ParamSpec::string("entity_id").describe("Target entity, e.g. 'light.kitchen'"),
            ParamSpec::object("data").describe("Extra service data"),
        ],
        ha_service_call,
    ))?;

    Ok(registry)
}

// ─── Groceries ──────────────────────────────────────────────────────────────

fn default_qty() -> u32 {
    1
}

#[derive(Deserialize)]
struct AddGroceryArgs {
    item: String,
    #[serde(default = "default_qty")]
    qty: u32,
    #[serde(default)]
    notes: Option<String>,
}

async fn add_to_groceries(args: AddGroceryArgs, ctx: ToolContext) -> Result<Value, ToolError> {
    let item = ctx
        .backends
        .groceries
        .add_grocery(
            &ctx.scope,
            NewGroceryItem {
                name: args.item.trim().to_string(),
                qty: args.qty,
                notes: args.notes,
            },
        )
        .await?;
    Ok(json!({ "item": grocery_json(&item, None) }))
}

fn default_grocery_limit() -> usize {
    100
}

#[derive(Deserialize)]
struct ListGroceriesArgs {
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "default_grocery_limit")]
    limit: usize,
}

async fn list_groceries(args: ListGroceriesArgs, ctx: ToolContext) -> Result<Value, ToolError> {
    let status = args
        .status
        .as_deref()
        .map(parse_canonical::<GroceryStatus>)
        .transpose()?;
    let items = ctx
        .backends
        .groceries
        .list_groceries(&ctx.scope, status, args.limit)
        .await?;
    let positions = positions(&ctx, ResourceKind::Grocery).await?;

    let items: Vec<Value> = items
        .iter()
        .map(|item| grocery_json(item, positions.get(&item.id).copied()))
        .collect();
    Ok(json!({ "count": items.len(), "items": items }))
}

#[derive(Deserialize)]
struct UpdateGroceryStatusArgs {
    id: String,
    status: String,
}

async fn update_grocery_status(
    args: UpdateGroceryStatusArgs,
    ctx: ToolContext,
) -> Result<Value, ToolError> {
    let status = parse_canonical::<GroceryStatus>(&args.status)?;
    let item = ctx
        .backends
        .groceries
        .set_grocery_status(&ctx.scope, &args.id, status)
        .await?;
    Ok(json!({ "item": grocery_json(&item, None) }))
}

fn grocery_json(item: &GroceryItem, idx: Option<usize>) -> Value {
    let mut value = json!({
        "id": item.id,
        "item": item.name,
        "qty": item.qty,
        "notes": item.notes,
        "status": item.status.as_str(),
        "created_at": item.created_at,
    });
    with_idx(&mut value, idx);
    value
}

// ─── Tasks ──────────────────────────────────────────────────────────────────

fn default_context() -> String {
    "Home".to_string()
}

fn default_priority() -> TaskPriority {
    TaskPriority::Med
}

#[derive(Deserialize)]
struct CreateTaskArgs {
    title: String,
    due: DateTime<Utc>,
    #[serde(default = "default_context")]
    context: String,
    #[serde(default = "default_priority")]
    priority: TaskPriority,
}

async fn create_task(args: CreateTaskArgs, ctx: ToolContext) -> Result<Value, ToolError> {
    let task = ctx
        .backends
        .tasks
        .create_task(
            &ctx.scope,
            NewTask {
                title: args.title.trim().to_string(),
                due: args.due,
                context: args.context,
                priority: args.priority,
            },
        )
        .await?;
    Ok(json!({ "task": task_json(&task, None) }))
}

fn default_task_limit() -> usize {
    50
}

#[derive(Deserialize)]
struct ListTasksArgs {
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "default_task_limit")]
    limit: usize,
}

async fn list_tasks(args: ListTasksArgs, ctx: ToolContext) -> Result<Value, ToolError> {
    let status = args
        .status
        .as_deref()
        .map(parse_canonical::<TaskStatus>)
        .transpose()?;
    let tasks = ctx
        .backends
        .tasks
        .list_tasks(&ctx.scope, status, args.limit)
        .await?;
    let positions = positions(&ctx, ResourceKind::Task).await?;

    let tasks: Vec<Value> = tasks
        .iter()
        .map(|task| task_json(task, positions.get(&task.id).copied()))
        .collect();
    Ok(json!({ "count": tasks.len(), "tasks": tasks }))
}

#[derive(Deserialize)]
struct UpdateTaskStatusArgs {
    id: String,
    status: String,
}

async fn update_task_status(
    args: UpdateTaskStatusArgs,
    ctx: ToolContext,
) -> Result<Value, ToolError> {
    let status = parse_canonical::<TaskStatus>(&args.status)?;
    let task = ctx
        .backends
        .tasks
        .set_task_status(&ctx.scope, &args.id, status)
        .await?;
    Ok(json!({ "task": task_json(&task, None) }))
}

fn task_json(task: &Task, idx: Option<usize>) -> Value {
    let mut value = json!({
        "id": task.id,
        "title": task.title,
        "due": task.due,
        "context": task.context,
        "priority": task.priority.as_str(),
        "status": task.status.as_str(),
        "created_at": task.created_at,
    });
    with_idx(&mut value, idx);
    value
}

// ─── Calendar ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateEventArgs {
    title: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    #[serde(default)]
    description: Option<String>,
}

async fn create_event(args: CreateEventArgs, ctx: ToolContext) -> Result<Value, ToolError> {
    if args.end < args.start {
        return Err(ToolError::validation("event end is before its start")
            .with_details(json!({ "start": args.start, "end": args.end })));
    }
    let event = ctx
        .backends
        .calendar
        .create_event(
            &ctx.scope,
            NewCalendarEvent {
                title: args.title.trim().to_string(),
                start: args.start,
                end: args.end,
                description: args.description,
            },
        )
        .await?;
    Ok(json!({ "event": event_json(&event, None) }))
}

fn default_max_results() -> usize {
    50
}

#[derive(Deserialize)]
struct ListEventsArgs {
    #[serde(default)]
    from_dt: Option<DateTime<Utc>>,
    #[serde(default)]
    to_dt: Option<DateTime<Utc>>,
    #[serde(default = "default_max_results")]
    max_results: usize,
}

async fn list_calendar_events(args: ListEventsArgs, ctx: ToolContext) -> Result<Value, ToolError> {
    let from = args.from_dt.unwrap_or_else(Utc::now);
    let to = args.to_dt.unwrap_or(from + Duration::days(7));
    if to < from {
        return Err(ToolError::validation("to_dt is before from_dt")
            .with_details(json!({ "from_dt": from, "to_dt": to })));
    }

    let events = ctx
        .backends
        .calendar
        .list_events(&ctx.scope, from, to, args.max_results)
        .await?;
    let positions = positions(&ctx, ResourceKind::CalendarEvent).await?;

    let events: Vec<Value> = events
        .iter()
        .map(|event| event_json(event, positions.get(&event.id).copied()))
        .collect();
    Ok(json!({ "count": events.len(), "from_dt": from, "to_dt": to, "events": events }))
}

fn event_json(event: &CalendarEvent, idx: Option<usize>) -> Value {
    let mut value = json!({
        "id": event.id,
        "title": event.title,
        "start": event.start,
        "end": event.end,
        "description": event.description,
    });
    with_idx(&mut value, idx);
    value
}

// ─── Home Assistant ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct HaServiceCallArgs {
    domain: String,
    service: String,
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

async fn ha_service_call(args: HaServiceCallArgs, ctx: ToolContext) -> Result<Value, ToolError> {
    for (field, value) in [("domain", &args.domain), ("service", &args.service)] {
        if value.is_empty() || !value.chars().all(is_ha_word_char) {
            return Err(ToolError::validation(format!(
                "{field} must be lowercase letters, digits or underscores"
            ))
            .with_details(json!({ "field": field, "value": value })));
        }
    }

    let call = ServiceCall {
        domain: args.domain,
        service: args.service,
        entity_id: args.entity_id,
        data: args.data,
    };
    Ok(ctx.backends.home.call_service(call).await?)
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn is_ha_word_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'
}

/// Canonical status value produced by the normalizer.
fn parse_canonical<T>(value: &str) -> Result<T, ToolError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| ToolError::validation(e.to_string()))
}

/// id -> 1-based position in the creation-ordered listing.
async fn positions(ctx: &ToolContext, kind: ResourceKind) -> Result<HashMap<String, usize>, ToolError> {
    let ids = ctx.backends.listing.list_ordered_ids(kind, &ctx.scope).await?;
    Ok(ids.into_iter().enumerate().map(|(i, id)| (id, i + 1)).collect())
}

fn with_idx(value: &mut Value, idx: Option<usize>) {
    if let (Some(idx), Some(obj)) = (idx, value.as_object_mut()) {
        obj.insert("idx".into(), json!(idx));
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
