//! Session internals guarded by the facade's lock.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use mnemo_core::ids::{EntityId, MessageId, SessionId};
use tracing::debug;

use crate::constants::{MAX_CO_MENTION_EDGES, MAX_DIAGNOSTICS, RELATION_MENTIONED_WITH};
use crate::entity_store::EntityStore;
use crate::errors::{ContextError, Result};
use crate::extraction::ExtractedEntity;
use crate::manual_context::ManualContextRegistry;
use crate::message_log::MessageLog;
use crate::persistence::validate_state;
use crate::summarizer::CompactionCoordinator;
use crate::token_budget::{TokenBudget, Tokenizer};
use crate::types::{
    AgentScope, CompactionRecord, Diagnostic, Entity, EntityLabel, Message, Role, SessionState,
};

use super::SessionPhase;

/// Window selected for compaction, captured under the lock.
pub(super) struct CompactionPlan {
    pub(super) epoch: u64,
    pub(super) window: Vec<Message>,
    pub(super) ids: Vec<MessageId>,
    pub(super) window_cost: u64,
    pub(super) entity_ids: Vec<EntityId>,
    pub(super) entities: Vec<Entity>,
}

/// What a mutation that grew the total should do about compaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Followup {
    /// Still at or under the threshold.
    Nothing,
    /// Over the threshold, but a compaction is already running.
    InFlight,
    /// Over the threshold and idle: compact.
    Compact,
}

pub(super) struct SessionInner {
    pub(super) session_id: SessionId,
    pub(super) phase: SessionPhase,
    pub(super) entities: EntityStore,
    pub(super) messages: MessageLog,
    pub(super) manual: ManualContextRegistry,
    pub(super) budget: TokenBudget,
    pub(super) scope: AgentScope,
    pub(super) coordinator: CompactionCoordinator,
    pub(super) compactions: Vec<CompactionRecord>,
    pub(super) diagnostics: Vec<Diagnostic>,
    pub(super) state: BTreeMap<String, serde_json::Value>,
    /// Bumped on every restore; stale compaction plans compare against it.
    pub(super) epoch: u64,
    /// Bumped on every persisted mutation.
    revision: u64,
    /// `revision` as of the last successful save or restore.
    saved_revision: u64,
}

impl SessionInner {
    pub(super) fn new(tokenizer: Arc<dyn Tokenizer>, max_tokens: u64, ratio: f64) -> Self {
        Self {
            session_id: SessionId::new(),
            phase: SessionPhase::Initialized,
            entities: EntityStore::new(),
            messages: MessageLog::new(),
            manual: ManualContextRegistry::new(),
            budget: TokenBudget::new(tokenizer, max_tokens, ratio),
            scope: AgentScope::default(),
            coordinator: CompactionCoordinator::default(),
            compactions: Vec::new(),
            diagnostics: Vec::new(),
            state: BTreeMap::new(),
            epoch: 0,
            revision: 0,
            saved_revision: 0,
        }
    }

    /// Rebuild from a persisted state. Budget parameters come from the state.
    pub(super) fn from_state(
        state: SessionState,
        tokenizer: Arc<dyn Tokenizer>,
        epoch: u64,
    ) -> Result<Self> {
        validate_state(&state).map_err(ContextError::PersistenceCorruption)?;
        let budget = TokenBudget::new(tokenizer, state.max_tokens, state.summarization_ratio)
            .with_total(state.token_count);
        Ok(Self {
            session_id: state.session_id,
            phase: SessionPhase::Active,
            entities: EntityStore::from_entities(state.entities),
            messages: MessageLog::from_messages(state.messages),
            manual: ManualContextRegistry::from_items(state.manual_items),
            budget,
            scope: state.agent_scope,
            coordinator: CompactionCoordinator::default(),
            compactions: state.compactions,
            diagnostics: state.diagnostics,
            state: state.state,
            epoch,
            revision: 0,
            saved_revision: 0,
        })
    }

    pub(super) fn to_state(&self) -> SessionState {
        SessionState {
            session_id: self.session_id.clone(),
            messages: self.messages.messages().to_vec(),
            entities: self.entities.entities().clone(),
            manual_items: self.manual.list().to_vec(),
            token_count: self.budget.token_count(),
            max_tokens: self.budget.max_tokens(),
            summarization_ratio: self.budget.summarization_ratio(),
            agent_scope: self.scope.clone(),
            compactions: self.compactions.clone(),
            diagnostics: self.diagnostics.clone(),
            state: self.state.clone(),
        }
    }

    /// Record a mutation: leave `Initialized` and mark the state unsaved.
    pub(super) fn touch(&mut self) {
        if self.phase == SessionPhase::Initialized {
            self.phase = SessionPhase::Active;
        }
        self.revision += 1;
    }

    pub(super) fn revision(&self) -> u64 {
        self.revision
    }

    /// Changed since the last successful save or restore.
    pub(super) fn is_dirty(&self) -> bool {
        self.revision != self.saved_revision
    }

    /// A snapshot taken at `revision` under `epoch` reached the store.
    pub(super) fn mark_saved(&mut self, epoch: u64, revision: u64) {
        if epoch == self.epoch {
            self.saved_revision = self.saved_revision.max(revision);
        }
    }

    pub(super) fn compaction_followup(&self) -> Followup {
        if !self.budget.over_threshold() {
            Followup::Nothing
        } else if self.coordinator.is_idle() {
            Followup::Compact
        } else {
            Followup::InFlight
        }
    }

    pub(super) fn push_diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
        if self.diagnostics.len() > MAX_DIAGNOSTICS {
            let excess = self.diagnostics.len() - MAX_DIAGNOSTICS;
            let _ = self.diagnostics.drain(..excess);
        }
    }

    /// Sum of component costs, for comparison with the cached total.
    pub(super) fn component_total(&self) -> u64 {
        self.messages
            .messages()
            .iter()
            .map(|m| m.token_cost)
            .sum::<u64>()
            + self.manual.total_cost()
    }

    /// Merge extractor output into the store and link co-mentions.
    /// Returns the distinct entity IDs in first-mention order.
    pub(super) fn merge_extracted(&mut self, found: &[ExtractedEntity]) -> Result<Vec<EntityId>> {
        let now = Utc::now();
        let mut ids: Vec<EntityId> = Vec::new();
        for e in found {
            let label = EntityLabel::parse(&e.label);
            match self.entities.add_or_merge_at(&e.text, label, e.confidence, now) {
                Ok(id) if !ids.contains(&id) => ids.push(id),
                Ok(_) => {}
                Err(err) => debug!(error = %err, text = %e.text, "skipping extracted entity"),
            }
        }

        for (i, from) in ids.iter().enumerate() {
            let peers = ids
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, id)| id)
                .take(MAX_CO_MENTION_EDGES);
            for to in peers {
                let _ = self.entities.relate(from, RELATION_MENTIONED_WITH, to)?;
            }
        }
        Ok(ids)
    }

    /// Messages visible from the active scope.
    pub(super) fn visible_messages(&self) -> Vec<Message> {
        self.messages.iter_scope(&self.scope).cloned().collect()
    }

    // ── Compaction ──────────────────────────────────────────────────────

    /// Snapshot the oldest messages outside the protected tail.
    /// `None` when fewer than two messages are eligible.
    pub(super) fn plan_compaction(&self, preserve_recent: usize) -> Option<CompactionPlan> {
        let window = self.messages.oldest_outside_recent(preserve_recent);
        if window.len() < 2 {
            return None;
        }
        let window = window.to_vec();
        let ids: Vec<MessageId> = window.iter().map(|m| m.id.clone()).collect();
        let window_cost = window.iter().map(|m| m.token_cost).sum();

        let mut entity_ids: Vec<EntityId> = Vec::new();
        for id in window.iter().flat_map(|m| &m.entity_refs) {
            if !entity_ids.contains(id) {
                entity_ids.push(id.clone());
            }
        }
        let entities = entity_ids
            .iter()
            .filter_map(|id| self.entities.get(id).cloned())
            .collect();

        Some(CompactionPlan {
            epoch: self.epoch,
            window,
            ids,
            window_cost,
            entity_ids,
            entities,
        })
    }

    /// Swap the planned window for one summary message and prune entities
    /// that only the window referenced and that score below `prune_threshold`.
    pub(super) fn apply_compaction(
        &mut self,
        plan: &CompactionPlan,
        summary: String,
        summary_cost: u64,
        prune_threshold: f64,
    ) -> Result<CompactionRecord> {
        let tokens_before = self.budget.token_count();
        if plan.window_cost > tokens_before {
            return Err(ContextError::ConcurrentMutationConflict(format!(
                "window cost {} exceeds session total {tokens_before}",
                plan.window_cost
            )));
        }

        let window_ids: HashSet<&MessageId> = plan.ids.iter().collect();
        let surviving_refs = self.messages.entity_refs_outside(&window_ids);
        let candidates: Vec<EntityId> = plan
            .entity_ids
            .iter()
            .filter(|id| !surviving_refs.contains(*id))
            .cloned()
            .collect();
        let pruned = self
            .entities
            .prunable(&candidates, prune_threshold, Utc::now());
        let kept_refs: Vec<EntityId> = plan
            .entity_ids
            .iter()
            .filter(|id| self.entities.get(id).is_some() && !pruned.contains(*id))
            .cloned()
            .collect();

        let message = Message::new(
            Role::Summary,
            summary.clone(),
            summary_cost,
            summary_scope(&plan.window),
            kept_refs,
        );
        let summary_message_id = message.id.clone();
        let removed = self.messages.replace_window(&plan.ids, message)?;
        let removed_cost: u64 = removed.iter().map(|m| m.token_cost).sum();
        self.budget.replace(removed_cost, summary_cost)?;

        for id in &pruned {
            let _ = self.entities.remove(id);
        }

        let record = CompactionRecord {
            summary_message_id: Some(summary_message_id),
            summary,
            tokens_before,
            tokens_after: self.budget.token_count(),
            messages_replaced: removed.len(),
            entities_pruned: pruned.len(),
            at: Utc::now(),
        };
        self.compactions.push(record.clone());
        self.touch();
        Ok(record)
    }
}

/// A window from a single scope stays in that scope; a mixed window is shared.
fn summary_scope(window: &[Message]) -> AgentScope {
    match window.split_first() {
        Some((first, rest)) if rest.iter().all(|m| m.agent_scope == first.agent_scope) => {
            first.agent_scope.clone()
        }
        _ => AgentScope::shared(),
    }
}
