//! Vocabulary Normalizer: human status words to canonical store statuses.
//!
//! Matching is case-insensitive and exact after trimming. There is no fuzzy
//! matching: a word that is not in the table is a validation error, reported
//! to the model with the word and the resource kind.

use std::collections::{BTreeMap, HashMap};

use serde_json::json;

use crate::stores::{CanonicalStatus, GroceryStatus, ResourceKind, TaskStatus};

use super::errors::{AgentError, ToolError};

// ─── Defaults ───────────────────────────────────────────────────────────────

const GROCERY_WORDS: &[(&str, GroceryStatus)] = &[
    ("needed", GroceryStatus::NotPurchased),
    ("added", GroceryStatus::NotPurchased),
    ("in cart", GroceryStatus::NotPurchased),
    ("in_cart", GroceryStatus::NotPurchased),
    ("not purchased", GroceryStatus::NotPurchased),
    ("not_purchased", GroceryStatus::NotPurchased),
    ("ordered", GroceryStatus::Purchased),
    ("purchased", GroceryStatus::Purchased),
];

const TASK_WORDS: &[(&str, TaskStatus)] = &[
    ("not started", TaskStatus::Todo),
    ("todo", TaskStatus::Todo),
    ("in progress", TaskStatus::InProgress),
    ("in_progress", TaskStatus::InProgress),
    ("done", TaskStatus::Done),
    ("completed", TaskStatus::Done),
    ("archived", TaskStatus::Archived),
];

// ─── Vocabulary ─────────────────────────────────────────────────────────────

/// Per-kind status word tables. Read-only once built.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    grocery: HashMap<String, GroceryStatus>,
    task: HashMap<String, TaskStatus>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            grocery: GROCERY_WORDS
                .iter()
                .map(|(word, status)| (word.to_string(), *status))
                .collect(),
            task: TASK_WORDS
                .iter()
                .map(|(word, status)| (word.to_string(), *status))
                .collect(),
        }
    }
}

impl Vocabulary {
    /// Default tables extended with `word -> canonical value` overrides.
    ///
    /// Canonical values must name an existing status (`purchased`,
    /// `in_progress`, …); anything else fails at load time.
    pub fn with_overrides(
        grocery: &BTreeMap<String, String>,
        task: &BTreeMap<String, String>,
    ) -> Result<Self, AgentError> {
        let mut vocab = Self::default();

        for (word, canonical) in grocery {
            let status = canonical.parse::<GroceryStatus>().map_err(|e| AgentError::Config {
                reason: format!("vocabulary.grocery '{word}': {e}"),
            })?;
            vocab.grocery.insert(fold(word), status);
        }
        for (word, canonical) in task {
            let status = canonical.parse::<TaskStatus>().map_err(|e| AgentError::Config {
                reason: format!("vocabulary.task '{word}': {e}"),
            })?;
            vocab.task.insert(fold(word), status);
        }

        Ok(vocab)
    }

    /// Map a status word to the canonical status of `kind`.
    pub fn normalize(&self, kind: ResourceKind, token: &str) -> Result<CanonicalStatus, ToolError> {
        let key = fold(token);
        let status = match kind {
            ResourceKind::Grocery => self.grocery.get(&key).copied().map(CanonicalStatus::Grocery),
            ResourceKind::Task => self.task.get(&key).copied().map(CanonicalStatus::Task),
            ResourceKind::CalendarEvent => None,
        };

        status.ok_or_else(|| {
            ToolError::validation(format!("'{}' is not a recognised {kind} status", token.trim()))
                .with_details(json!({
                    "token": token,
                    "resource_kind": kind,
                    "accepted": self.words(kind),
                }))
        })
    }

    /// Accepted words for `kind`, sorted.
    pub fn words(&self, kind: ResourceKind) -> Vec<&str> {
        let mut words: Vec<&str> = match kind {
            ResourceKind::Grocery => self.grocery.keys().map(String::as_str).collect(),
            ResourceKind::Task => self.task.keys().map(String::as_str).collect(),
            ResourceKind::CalendarEvent => Vec::new(),
        };
        words.sort_unstable();
        words
    }
}

fn fold(word: &str) -> String {
    word.trim().to_lowercase()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
