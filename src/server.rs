//! HTTP surface.
//!
//! - `POST /ai/respond`, `POST /ai/chat`: SSE stream of driver events
//! - `POST /ai/conversation`: the same run, answered as one JSON body
//! - `GET /ai/tools/health`: tool registry and model diagnostics
//! - `GET /healthz`
//!
//! `/ai/*` routes require the configured `x-api-key`. The optional
//! `x-user-id` header selects the caller scope.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent_core::{
    default_registry, emitter, validate_history, ChatMode, ChatRequest, ConversationDriver,
    DriverOutcome, DriverSettings, DriverState, Message, StreamEvent, StreamEmitter, ToolRouter,
    Vocabulary, SYSTEM_PROMPT,
};
use crate::config::AppConfig;
use crate::inference::types::ChatMessage;
use crate::inference::InferenceClient;
use crate::stores::home_assistant::HomeAssistantClient;
use crate::stores::sqlite::SqliteStore;
use crate::stores::{Backends, HomeAutomation, ScopeKey};

const API_KEY_HEADER: &str = "x-api-key";
const USER_ID_HEADER: &str = "x-user-id";

// ─── State ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    driver: Arc<ConversationDriver>,
    api_key: Arc<str>,
    event_buffer: usize,
    model: ModelStatus,
}

/// Model details reported by `/ai/tools/health`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub api_key_configured: bool,
}

impl AppState {
    pub fn new(driver: Arc<ConversationDriver>, api_key: &str, event_buffer: usize) -> Self {
        Self {
            driver,
            api_key: Arc::from(api_key),
            event_buffer,
            model: ModelStatus::default(),
        }
    }

    pub fn with_model_status(mut self, model: ModelStatus) -> Self {
        self.model = model;
        self
    }

    /// Wire stores, tools and the model client from configuration.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let db_path = config.storage.resolved_database_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data directory {}", parent.display()))?;
        }
        let store = SqliteStore::open(&db_path.to_string_lossy()).context("open database")?;
        tracing::info!(db_path = %db_path.display(), "database ready");

        let home: Arc<dyn HomeAutomation> = match config.home_assistant {
            Some(ref ha) => Arc::new(
                HomeAssistantClient::new(&ha.base_url, &ha.token, Duration::from_secs(ha.timeout_secs))
                    .context("build Home Assistant client")?,
            ),
            None => {
                tracing::info!("home_assistant not configured; ha_service_call will report errors");
                Arc::new(HomeAssistantClient::unconfigured())
            }
        };
        let backends = Backends::local(Arc::new(store), home);

        let vocabulary = Vocabulary::with_overrides(&config.vocabulary.grocery, &config.vocabulary.task)
            .context("load vocabulary")?;
        let registry = default_registry(&vocabulary).context("build operation registry")?;
        tracing::info!(tools = ?registry.names(), "operation registry ready");

        let router = ToolRouter::new(Arc::new(registry), Arc::new(vocabulary), backends)
            .with_max_result_chars(config.agent.max_tool_result_chars);

        let client = InferenceClient::from_config(&config.models)
            .context("build inference client")?
            .with_parallel_tool_calls(config.agent.parallel_tool_calls);
        tracing::info!(model = %client.primary_model_name(), "inference client ready");
        let model = ModelStatus {
            name: client.primary_model_name().to_string(),
            api_key_configured: client.has_api_key(),
        };

        let settings = DriverSettings {
            max_turns: config.agent.max_turns,
            parallel_tool_calls: config.agent.parallel_tool_calls,
            system_prompt: config
                .agent
                .system_prompt
                .clone()
                .unwrap_or_else(|| SYSTEM_PROMPT.to_string()),
        };
        let driver = ConversationDriver::new(Arc::new(client), Arc::new(router), settings);

        if config.server.api_key.is_empty() {
            tracing::warn!("server.api_key is empty; /ai/* requests will be refused");
        }

        Ok(Self::new(
            Arc::new(driver),
            &config.server.api_key,
            config.server.event_buffer,
        )
        .with_model_status(model))
    }
}

// ─── Wire Types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RespondRequest {
    #[serde(default)]
    prompt: Option<String>,
    /// Accepted by `/ai/conversation` in place of `prompt`.
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    history: Vec<ChatMessage>,
    #[serde(default)]
    mode: ChatMode,
}

impl RespondRequest {
    fn into_chat_request(self) -> Result<ChatRequest, ApiError> {
        let prompt = self.prompt.or(self.message).unwrap_or_default();
        if prompt.trim().is_empty() {
            return Err(unprocessable("prompt must not be empty"));
        }

        let history: Vec<Message> = self.history.into_iter().map(Message::from).collect();
        validate_history(&history).map_err(|e| unprocessable(e.to_string()))?;

        Ok(ChatRequest::new(prompt)
            .with_history(history)
            .with_mode(self.mode))
    }
}

#[derive(Debug, Serialize)]
struct ConversationResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
        }),
    )
}

fn unprocessable(error: impl Into<String>) -> ApiError {
    api_error(StatusCode::UNPROCESSABLE_ENTITY, error)
}

// ─── Router ─────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/ai/respond", post(respond))
        .route("/ai/chat", post(respond))
        .route("/ai/conversation", post(conversation))
        .route("/ai/tools/health", get(tools_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the process is stopped.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("bind {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "listening");

    axum::serve(listener, app)
        .await
        .context("server terminated with error")
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Compare the advertised tool schemas with the registered handlers.
async fn tools_health(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;

    let registry = state.driver.router().registry();
    let handlers: BTreeSet<String> = registry.names().into_iter().map(String::from).collect();
    let schemas: BTreeSet<String> = registry
        .definitions()
        .into_iter()
        .map(|d| d.function.name)
        .collect();
    let schema_only: Vec<&String> = schemas.difference(&handlers).collect();
    let handler_only: Vec<&String> = handlers.difference(&schemas).collect();
    let status = if schema_only.is_empty() && handler_only.is_empty() {
        "healthy"
    } else {
        "warning"
    };

    Ok(Json(serde_json::json!({
        "status": status,
        "time": Utc::now().to_rfc3339(),
        "tools": {
            "total_schemas": schemas.len(),
            "total_handlers": handlers.len(),
            "names": registry.names(),
            "schema_only": schema_only,
            "handler_only": handler_only,
        },
        "model": state.model,
    })))
}

async fn respond(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RespondRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    authorize(&state, &headers)?;
    let request = body.into_chat_request()?;

    let (emitter, rx) = emitter::channel(state.event_buffer);
    spawn_run(&state, request, scope_from(&headers), emitter);

    let events = ReceiverStream::new(rx).map(|event| Ok(to_sse(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RespondRequest>,
) -> Result<Json<ConversationResponse>, ApiError> {
    authorize(&state, &headers)?;
    let request = body.into_chat_request()?;

    let (emitter, mut rx) = emitter::channel(state.event_buffer);
    let run = spawn_run(&state, request, scope_from(&headers), emitter);

    let mut failure = None;
    while let Some(event) = rx.recv().await {
        if let StreamEvent::Error { error } = event {
            failure = Some(error);
        }
    }

    let outcome = run
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| unprocessable("invalid history"))?;

    match outcome.state {
        DriverState::Done | DriverState::ToolLimitExceeded => Ok(Json(ConversationResponse {
            response: outcome.reply,
        })),
        DriverState::UpstreamFailed => Err(api_error(
            StatusCode::BAD_GATEWAY,
            failure.unwrap_or_else(|| "model request failed".into()),
        )),
        _ => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            failure.unwrap_or_else(|| "request did not complete".into()),
        )),
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Run the driver on its own task under a per-request span. Yields `None`
/// if the history was rejected.
fn spawn_run(
    state: &AppState,
    request: ChatRequest,
    scope: ScopeKey,
    mut emitter: StreamEmitter,
) -> tokio::task::JoinHandle<Option<DriverOutcome>> {
    let correlation_id = Uuid::new_v4();
    let span = tracing::info_span!("request", correlation_id = %correlation_id, scope = %scope);
    let driver = Arc::clone(&state.driver);

    tracing::info!(
        parent: &span,
        prompt_length = request.prompt.len(),
        mode = ?request.mode,
        has_history = !request.history.is_empty(),
        "starting response"
    );

    tokio::spawn(
        async move {
            match driver.run(request, &scope, &mut emitter).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    tracing::warn!(error = %e, "request rejected");
                    None
                }
            }
        }
        .instrument(span),
    )
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if state.api_key.is_empty() {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "API key not configured",
        ));
    }
    let presented = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if presented == Some(&*state.api_key) {
        Ok(())
    } else {
        Err(api_error(StatusCode::UNAUTHORIZED, "invalid API key"))
    }
}

fn scope_from(headers: &HeaderMap) -> ScopeKey {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ScopeKey::new)
        .unwrap_or_default()
}

fn to_sse(event: &StreamEvent) -> Event {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|_| r#"{"type":"error","error":"event serialization failed"}"#.to_string());
    Event::default().data(payload)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
