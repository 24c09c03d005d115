//! Identifier Resolver: turns "the 2nd task" into a canonical id.
//!
//! A reference is either a canonical UUID, returned as-is without touching
//! the store, or a 1-based ordinal into the creation-ordered listing of the
//! caller's scope, fetched fresh on every call.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::stores::{ResourceKind, ResourceListing, ScopeKey};

use super::errors::ToolError;

/// Whether `reference` is a canonical hyphenated UUID.
pub fn is_canonical_id(reference: &str) -> bool {
    reference.len() == 36 && Uuid::try_parse(reference).is_ok()
}

pub struct IdentifierResolver {
    listing: Arc<dyn ResourceListing>,
}

impl IdentifierResolver {
    pub fn new(listing: Arc<dyn ResourceListing>) -> Self {
        Self { listing }
    }

    /// Resolve `reference` to the canonical id of a `kind` resource in `scope`.
    pub async fn resolve(
        &self,
        kind: ResourceKind,
        reference: &str,
        scope: &ScopeKey,
    ) -> Result<String, ToolError> {
        let reference = reference.trim();

        if is_canonical_id(reference) {
            return Ok(reference.to_lowercase());
        }

        let Ok(ordinal) = reference.parse::<i64>() else {
            return Err(ToolError::validation(format!(
                "'{reference}' is neither a {kind} id nor a list position"
            ))
            .with_details(json!({ "reference": reference, "resource_kind": kind })));
        };

        let ids = self
            .listing
            .list_ordered_ids(kind, scope)
            .await
            .map_err(|e| ToolError::upstream(format!("could not list {kind} items: {e}")))?;

        let position = usize::try_from(ordinal).ok().filter(|n| *n >= 1 && *n <= ids.len());
        match position {
            Some(n) => {
                let id = ids[n - 1].clone();
                tracing::debug!(kind = %kind, ordinal, id = %id, "resolved ordinal reference");
                Ok(id)
            }
            None => Err(ToolError::not_found(format!(
                "there is no {kind} #{ordinal}; the list has {} item(s)",
                ids.len()
            ))
            .with_details(json!({
                "index": ordinal,
                "length": ids.len(),
                "resource_kind": kind,
            }))),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
