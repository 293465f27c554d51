//! Registry of user-labeled context chunks.
//!
//! Labels are unique. Adding an existing label overwrites the item in place,
//! keeping its position and creation time.

use chrono::Utc;

use crate::errors::{ContextError, Result};
use crate::types::ManualContextItem;

/// Manual context items in insertion order.
#[derive(Clone, Debug, Default)]
pub struct ManualContextRegistry {
    items: Vec<ManualContextItem>,
}

impl ManualContextRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted items. Callers validate label uniqueness first.
    pub fn from_items(items: Vec<ManualContextItem>) -> Self {
        Self { items }
    }

    /// Insert or overwrite by label. Returns the overwritten item, if any.
    pub fn add(
        &mut self,
        label: &str,
        source: &str,
        content: &str,
        token_cost: u64,
    ) -> Result<Option<ManualContextItem>> {
        let label = label.trim();
        if label.is_empty() {
            return Err(ContextError::InvalidManualContext("label is empty".into()));
        }
        if content.trim().is_empty() {
            return Err(ContextError::InvalidManualContext(format!(
                "content for '{label}' is empty"
            )));
        }
        let now = Utc::now();

        if let Some(existing) = self.items.iter_mut().find(|i| i.label == label) {
            let previous = existing.clone();
            existing.source = source.to_owned();
            existing.content = content.to_owned();
            existing.token_cost = token_cost;
            existing.updated_at = now;
            return Ok(Some(previous));
        }

        self.items.push(ManualContextItem {
            label: label.to_owned(),
            source: source.to_owned(),
            content: content.to_owned(),
            token_cost,
            created_at: now,
            updated_at: now,
        });
        Ok(None)
    }

    /// Remove by label. `None` when the label was not present.
    pub fn remove(&mut self, label: &str) -> Option<ManualContextItem> {
        let label = label.trim();
        let pos = self.items.iter().position(|i| i.label == label)?;
        Some(self.items.remove(pos))
    }

    /// Look up by label.
    pub fn get(&self, label: &str) -> Option<&ManualContextItem> {
        let label = label.trim();
        self.items.iter().find(|i| i.label == label)
    }

    /// All items in insertion order.
    pub fn list(&self) -> &[ManualContextItem] {
        &self.items
    }

    /// Sum of item costs.
    pub fn total_cost(&self) -> u64 {
        self.items.iter().map(|i| i.token_cost).sum()
    }
}
