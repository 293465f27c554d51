//! Human- and machine-readable view of a session.

use std::fmt;

use mnemo_core::ids::SessionId;
use serde::Serialize;

use crate::constants::SUMMARY_RECENT_PER_LABEL;
use crate::entity_store::EntityStore;
use crate::summarizer::CompactionPhase;
use crate::token_budget::BudgetZone;
use crate::types::{AgentScope, EntityLabel, ManualContextItem};

/// Labels listed under "recent" in a summary, with their plural heading.
const RECENT_LABELS: [(EntityLabel, &str); 5] = [
    (EntityLabel::File, "files"),
    (EntityLabel::SearchQuery, "searches"),
    (EntityLabel::Command, "commands"),
    (EntityLabel::Url, "URLs"),
    (EntityLabel::Task, "tasks"),
];

/// Label and cost of one manual context item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ManualItemSummary {
    /// Label.
    pub label: String,
    /// Source.
    pub source: String,
    /// Token cost.
    pub token_cost: u64,
}

/// Most recently seen entities with one label.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecentEntities {
    /// Label.
    pub label: EntityLabel,
    /// Display texts, most recent first.
    pub items: Vec<String>,
}

/// Snapshot returned by `Session::get_context_summary`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContextSummary {
    /// Session ID.
    pub session_id: SessionId,
    /// Active scope.
    pub agent_scope: AgentScope,
    /// Current total.
    pub token_count: u64,
    /// Ceiling.
    pub max_tokens: u64,
    /// `token_count / max_tokens`.
    pub usage_ratio: f64,
    /// Usage zone.
    pub zone: BudgetZone,
    /// Messages visible from the active scope.
    pub message_count: usize,
    /// Tracked entities.
    pub entity_count: usize,
    /// Applied compactions.
    pub compaction_count: usize,
    /// Coordinator phase.
    pub compaction_phase: CompactionPhase,
    /// Manual context, insertion order.
    pub manual_items: Vec<ManualItemSummary>,
    /// Recent files, searches, commands, URLs, and tasks.
    pub recent: Vec<RecentEntities>,
}

pub(super) fn manual_summaries(items: &[ManualContextItem]) -> Vec<ManualItemSummary> {
    items
        .iter()
        .map(|i| ManualItemSummary {
            label: i.label.clone(),
            source: i.source.clone(),
            token_cost: i.token_cost,
        })
        .collect()
}

pub(super) fn recent_entities(store: &EntityStore) -> Vec<RecentEntities> {
    RECENT_LABELS
        .iter()
        .filter_map(|&(label, _)| {
            let items: Vec<String> = store
                .get_by_type(label)
                .into_iter()
                .take(SUMMARY_RECENT_PER_LABEL)
                .map(|e| e.display_text.clone())
                .collect();
            (!items.is_empty()).then_some(RecentEntities { label, items })
        })
        .collect()
}

fn heading(label: EntityLabel) -> &'static str {
    RECENT_LABELS
        .iter()
        .find(|(l, _)| *l == label)
        .map_or("entities", |(_, h)| h)
}

impl fmt::Display for ContextSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Context: {} messages, {} entities, {} compactions [scope: {}]",
            self.message_count, self.entity_count, self.compaction_count, self.agent_scope
        )?;
        write!(
            f,
            "Tokens: {}/{} ({:.1}%, {})",
            self.token_count,
            self.max_tokens,
            self.usage_ratio * 100.0,
            self.zone
        )?;
        if !self.manual_items.is_empty() {
            write!(f, "\nManual context:")?;
            for item in &self.manual_items {
                write!(
                    f,
                    "\n  - {} ({}): {} tokens",
                    item.label, item.source, item.token_cost
                )?;
            }
        }
        for group in &self.recent {
            write!(f, "\nRecent {}: {}", heading(group.label), group.items.join(", "))?;
        }
        Ok(())
    }
}
