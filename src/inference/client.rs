//! OpenAI-compatible inference client.
//!
//! Sends streaming chat completion requests and hands back a stream of
//! tokens and tool calls. Walks the fallback chain when a model is
//! unavailable; the chain is resolved per call, so the client holds no
//! mutable state and is shared across requests.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;

use super::config::{resolve_model_chain, ModelConfig, ModelsConfig};
use super::errors::InferenceError;
use super::model::{ChatModel, ChunkStream};
use super::streaming::parse_sse_stream;
use super::types::{ChatCompletionRequest, ChatMessage, ToolDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct InferenceClient {
    http: HttpClient,
    /// `(key, config)` in the order they are tried.
    chain: Vec<(String, ModelConfig)>,
    /// Forwarded as `parallel_tool_calls` when tools are offered.
    parallel_tool_calls: Option<bool>,
}

impl InferenceClient {
    /// Create a client from the models configuration.
    ///
    /// Does NOT check connectivity; that happens on the first request.
    pub fn from_config(config: &ModelsConfig) -> Result<Self, InferenceError> {
        let chain = resolve_model_chain(config)?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: chain[0].1.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            chain,
            parallel_tool_calls: None,
        })
    }

    /// Ask the provider to allow (or forbid) several tool calls per turn.
    pub fn with_parallel_tool_calls(mut self, allowed: bool) -> Self {
        self.parallel_tool_calls = Some(allowed);
        self
    }

    /// Display name of the first model in the chain.
    pub fn primary_model_name(&self) -> &str {
        &self.chain[0].1.display_name
    }

    /// Whether the first model in the chain carries a non-empty API key.
    pub fn has_api_key(&self) -> bool {
        self.chain[0]
            .1
            .api_key
            .as_deref()
            .is_some_and(|key| !key.is_empty())
    }

    fn build_request(
        &self,
        key: &str,
        model: &ModelConfig,
        messages: &[ChatMessage],
        tools: &Option<Vec<ToolDefinition>>,
    ) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.model_name.clone().unwrap_or_else(|| key.to_string()),
            messages: messages.to_vec(),
            tools: tools.clone(),
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            parallel_tool_calls: tools.as_ref().and(self.parallel_tool_calls),
            temperature: model.temperature,
            max_tokens: model.max_tokens,
            stream: true,
        }
    }

    /// Attempt a single streaming request against one model.
    async fn try_stream_request(
        &self,
        key: &str,
        model: &ModelConfig,
        messages: &[ChatMessage],
        tools: &Option<Vec<ToolDefinition>>,
    ) -> Result<ChunkStream, InferenceError> {
        let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));
        let body = self.build_request(key, model, messages, tools);

        // Request metadata only; the body can be large.
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            "sending chat completion request"
        );

        let mut request = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(model.request_timeout_secs))
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(ref api_key) = model.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: model.request_timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(parse_sse_stream(response.bytes_stream()).boxed())
    }
}

#[async_trait]
impl ChatModel for InferenceClient {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChunkStream, InferenceError> {
        let mut attempted = Vec::new();
        let mut last_error: Option<InferenceError> = None;

        for (key, model) in &self.chain {
            match self.try_stream_request(key, model, &messages, &tools).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retriable() => {
                    tracing::warn!(model = %key, error = %e, "model unavailable, trying next in chain");
                    attempted.push(key.clone());
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_error {
            Some(e) if attempted.len() == 1 => Err(e),
            _ => Err(InferenceError::AllModelsUnavailable { attempted }),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
