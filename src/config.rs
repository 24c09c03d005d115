//! Application configuration.
//!
//! Loaded from `pai.yaml`. String values may reference the environment as
//! `${VAR}` or `${VAR:-default}`; interpolation happens on the raw text
//! before YAML parsing. Every section has defaults, so an empty file (or no
//! file at all) yields a runnable configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::inference::ModelsConfig;

/// File name searched for when `PAI_CONFIG` is not set.
pub const CONFIG_FILE_NAME: &str = "pai.yaml";

/// Env var holding an explicit config path.
pub const CONFIG_ENV_VAR: &str = "PAI_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("{var} points to missing file {path}")]
    Missing { var: &'static str, path: String },
}

// ─── Sections ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub models: ModelsConfig,
    pub storage: StorageConfig,
    pub home_assistant: Option<HomeAssistantConfig>,
    pub vocabulary: VocabularyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Expected `x-api-key` header value.
    pub api_key: String,
    /// Events buffered per request before the driver waits on the client.
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            api_key: "test-key".into(),
            event_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum model round-trips per request.
    pub max_turns: usize,
    pub parallel_tool_calls: bool,
    pub max_tool_result_chars: usize,
    /// Replaces the built-in system prompt.
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 5,
            parallel_tool_calls: false,
            max_tool_result_chars: 8_000,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file. Defaults to `<data_dir>/pai.db`.
    pub database_path: Option<String>,
}

impl StorageConfig {
    pub fn resolved_database_path(&self) -> PathBuf {
        match self.database_path {
            Some(ref path) => PathBuf::from(expand_tilde(path)),
            None => crate::data_dir().join("pai.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HomeAssistantConfig {
    pub base_url: String,
    pub token: String,
    #[serde(default = "default_ha_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ha_timeout_secs() -> u64 {
    10
}

/// Extra status words: `word -> canonical status`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VocabularyConfig {
    pub grocery: BTreeMap<String, String>,
    pub task: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

// ─── Loading ────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// 1. `PAI_CONFIG`, which must exist if set.
/// 2. `pai.yaml` in `start` or any ancestor.
///
/// `Ok(None)` means no file was found and defaults apply.
pub fn find_config_path(start: &Path) -> Result<Option<PathBuf>, ConfigError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(expand_tilde(&explicit));
        if path.exists() {
            return Ok(Some(path));
        }
        return Err(ConfigError::Missing {
            var: CONFIG_ENV_VAR,
            path: path.display().to_string(),
        });
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(Some(candidate));
        }
        if !dir.pop() {
            return Ok(None);
        }
    }
}

/// Read, interpolate and parse one config file.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Find and load the config, falling back to defaults when there is no file.
pub fn load_or_default() -> Result<(AppConfig, Option<PathBuf>), ConfigError> {
    let cwd = std::env::current_dir().unwrap_or_default();
    match find_config_path(&cwd)? {
        Some(path) => Ok((load_config(&path)?, Some(path))),
        None => Ok((AppConfig::default(), None)),
    }
}

fn parse_config(raw: &str) -> Result<AppConfig, serde_yaml::Error> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(&interpolated)
}

// ─── Env-var interpolation ──────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset or empty variables take the default.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
