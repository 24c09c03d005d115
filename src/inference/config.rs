//! Model endpoint configuration.
//!
//! The `models` section of the application config: which OpenAI-compatible
//! endpoints are available and the order to fall back through them.

use std::collections::HashMap;

use serde::Deserialize;

use super::errors::InferenceError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// A single model endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelConfig {
    pub display_name: String,
    /// Name sent in the request body. Defaults to the config key.
    #[serde(default)]
    pub model_name: Option<String>,
    pub base_url: String,
    /// Bearer token for hosted providers. Local runtimes need none.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.3
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// Top-level model registry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelsConfig {
    pub active_model: String,
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        let mut models = HashMap::new();
        models.insert(
            "openai".to_string(),
            ModelConfig {
                display_name: "OpenAI".to_string(),
                model_name: Some("gpt-4o-mini".to_string()),
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: std::env::var("OPENAI_API_KEY").ok(),
                temperature: default_temperature(),
                max_tokens: None,
                request_timeout_secs: default_request_timeout_secs(),
            },
        );

        Self {
            active_model: "openai".to_string(),
            models,
            fallback_chain: Vec::new(),
        }
    }
}

// ─── Resolution ──────────────────────────────────────────────────────────────

/// The models to try, in order: the active model, then the fallback chain.
///
/// Unknown keys are skipped and duplicates dropped. Errors only when nothing
/// in the config is usable.
pub fn resolve_model_chain(
    config: &ModelsConfig,
) -> Result<Vec<(String, ModelConfig)>, InferenceError> {
    let mut chain: Vec<(String, ModelConfig)> = Vec::new();

    let keys = std::iter::once(&config.active_model).chain(config.fallback_chain.iter());
    for key in keys {
        if chain.iter().any(|(k, _)| k == key) {
            continue;
        }
        match config.models.get(key) {
            Some(model) => chain.push((key.clone(), model.clone())),
            None => tracing::warn!(model = %key, "model key not found in config, skipping"),
        }
    }

    if chain.is_empty() {
        return Err(InferenceError::ConfigError {
            reason: format!(
                "active model '{}' not found in config and no fallback available",
                config.active_model
            ),
        });
    }

    Ok(chain)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
