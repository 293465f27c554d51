//! Session facade.
//!
//! [`Session`] composes the entity store, message log, manual context
//! registry, token budget, compaction coordinator, and persistence behind a
//! single `tokio::sync::RwLock`.
//!
//! ## Locking
//!
//! Every mutation takes the write guard, so at most one mutation is in
//! flight and queued writers are served in arrival order. Reads share the
//! read guard. Slow external calls never hold the lock:
//!
//! - **Extraction** runs before the guard is taken; only the merge is locked.
//! - **Compaction** snapshots the window under the guard, releases it for the
//!   summarizer call, then re-acquires it to swap exactly that window.
//! - **Save** snapshots under a read guard and writes from a blocking task.
//!
//! Saves are serialized by a separate gate held from snapshot until the
//! store write returns, so a later snapshot is never overwritten by an
//! earlier one. [`Session::phase`] reports `Saving` while that gate is held
//! and `Summarizing` while the compaction coordinator is not idle.
//!
//! A compaction run that is dropped between leaving `Idle` and its final
//! transition (its caller was cancelled, or the summarizer panicked) hands
//! the coordinator back to `Idle` from a drop guard.

mod autosave;
mod inner;
mod summary;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mnemo_core::ids::{EntityId, MessageId, SessionId};
use mnemo_core::retry::RetryConfig;
use mnemo_settings::{CompactionMode, MnemoSettings};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::constants::MESSAGE_RECENCY_WEIGHT;
use crate::errors::{ContextError, Result};
use crate::extraction::{EntityExtractor, ExtractedEntity, PatternExtractor};
use crate::persistence::{self, SnapshotStore, VersionedRecord};
use crate::relevance::{
    LexicalScorer, RelevantItem, RelevantSource, SemanticScorer, select_within_budget,
};
use crate::summarizer::{
    CompactionOutcome, CompactionPhase, SkipReason, Summarizer, summarize_with_retry,
};
use crate::token_budget::{HeuristicTokenizer, Tokenizer};
use crate::types::{
    AgentScope, CompactionRecord, Diagnostic, DiagnosticKind, Entity, EntityLabel, Message, Role,
};

use inner::{CompactionPlan, Followup, SessionInner};
pub use autosave::AutosaveHandle;
pub use summary::{ContextSummary, ManualItemSummary, RecentEntities};

// =============================================================================
// Configuration
// =============================================================================

/// Collaborators injected into a session.
#[derive(Clone)]
pub struct SessionDeps {
    /// Token counter.
    pub tokenizer: Arc<dyn Tokenizer>,
    /// Primary entity extractor.
    pub extractor: Arc<dyn EntityExtractor>,
    /// Compaction summarizer.
    pub summarizer: Arc<dyn Summarizer>,
    /// Query/candidate matcher for relevant context.
    pub scorer: Arc<dyn SemanticScorer>,
    /// Snapshot target.
    pub store: Arc<dyn SnapshotStore>,
}

impl SessionDeps {
    /// Deps with the heuristic tokenizer, the pattern extractor, and the lexical scorer.
    pub fn new(summarizer: Arc<dyn Summarizer>, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            tokenizer: Arc::new(HeuristicTokenizer),
            extractor: Arc::new(PatternExtractor),
            summarizer,
            scorer: Arc::new(LexicalScorer),
            store,
        }
    }

    /// Replace the tokenizer.
    #[must_use]
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    /// Replace the extractor.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Replace the scorer.
    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn SemanticScorer>) -> Self {
        self.scorer = scorer;
        self
    }
}

impl fmt::Debug for SessionDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDeps")
            .field("store", &self.store.describe())
            .finish_non_exhaustive()
    }
}

/// Tunables for one session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Budget ceiling for a fresh session.
    pub max_tokens: u64,
    /// Trigger ratio for a fresh session.
    pub summarization_ratio: f64,
    /// Most recent messages never compacted.
    pub preserve_recent: usize,
    /// Per-attempt summarizer timeout.
    pub summary_timeout: Duration,
    /// Summarizer attempts and backoff.
    pub retry: RetryConfig,
    /// Inline or background compaction.
    pub mode: CompactionMode,
    /// Relevance below which window-only entities are pruned.
    pub entity_prune_threshold: f64,
    /// Extractor timeout.
    pub extraction_timeout: Duration,
    /// Extract entities from user and agent messages.
    pub track_messages: bool,
    /// Token budget for relevant-context results.
    pub relevant_context_tokens: u64,
    /// Period of [`Session::spawn_autosave`]. `None` disables it.
    pub autosave_interval: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&MnemoSettings::default())
    }
}

impl SessionConfig {
    /// Derive a session config from loaded settings.
    pub fn from_settings(settings: &MnemoSettings) -> Self {
        Self {
            max_tokens: settings.budget.max_tokens,
            summarization_ratio: settings.budget.summarization_ratio,
            preserve_recent: settings.compaction.preserve_recent,
            summary_timeout: Duration::from_millis(settings.compaction.timeout_ms),
            retry: settings.compaction.retry.clone(),
            mode: settings.compaction.mode,
            entity_prune_threshold: settings.compaction.entity_prune_threshold,
            extraction_timeout: Duration::from_millis(settings.extraction.timeout_ms),
            track_messages: settings.extraction.track_messages,
            relevant_context_tokens: settings.retrieval.relevant_context_tokens,
            autosave_interval: settings
                .persistence
                .autosave_interval_ms
                .map(Duration::from_millis),
        }
    }
}

/// Session lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Created, nothing added or loaded yet.
    Initialized,
    /// Accepting operations.
    Active,
    /// A compaction is planning, summarizing, or swapping its window.
    Summarizing,
    /// A save is snapshotting or writing.
    Saving,
}

/// Result of adding a message.
#[derive(Clone, Debug, PartialEq)]
pub struct Appended {
    /// New message ID.
    pub id: MessageId,
    /// Tokens charged.
    pub token_cost: u64,
    /// Entities the message mentions.
    pub entity_refs: Vec<EntityId>,
    /// Compaction triggered by this append, if any.
    pub compaction: Option<CompactionOutcome>,
}

/// Result of setting a manual context item.
#[derive(Clone, Debug, PartialEq)]
pub struct ManualContextSet {
    /// Tokens charged for the new content.
    pub token_cost: u64,
    /// Whether an item with the same label was overwritten.
    pub replaced: bool,
    /// Compaction triggered by the change, if any.
    pub compaction: Option<CompactionOutcome>,
}

// =============================================================================
// Session
// =============================================================================

/// Thread-safe session handle. Clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<RwLock<SessionInner>>,
    save_gate: Arc<Mutex<()>>,
    background: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
    deps: SessionDeps,
    config: SessionConfig,
    fallback: PatternExtractor,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Fresh, empty session.
    pub fn new(config: SessionConfig, deps: SessionDeps) -> Self {
        let inner = SessionInner::new(
            Arc::clone(&deps.tokenizer),
            config.max_tokens,
            config.summarization_ratio,
        );
        Self {
            inner: Arc::new(RwLock::new(inner)),
            save_gate: Arc::new(Mutex::new(())),
            background: Arc::new(parking_lot::Mutex::new(Vec::new())),
            deps,
            config,
            fallback: PatternExtractor,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ── Messages ────────────────────────────────────────────────────────

    /// Append a message in the active scope.
    ///
    /// User and agent messages are run through entity extraction first (when
    /// enabled). If the total is over the threshold afterwards, a compaction
    /// runs inline or is scheduled, per [`SessionConfig::mode`].
    #[instrument(skip_all, fields(role = %role))]
    pub async fn add_message(&self, role: Role, content: &str) -> Result<Appended> {
        if role == Role::Summary {
            return Err(ContextError::InvalidMessage(
                "summary messages are produced by compaction only".into(),
            ));
        }
        if content.trim().is_empty() {
            return Err(ContextError::InvalidMessage("message content is empty".into()));
        }

        let token_cost = self.deps.tokenizer.count_tokens(content);
        let extracted = if self.config.track_messages && role != Role::System {
            Some(self.extract(content).await)
        } else {
            None
        };

        let (appended, followup) = {
            let mut inner = self.inner.write().await;
            let entity_refs = match extracted {
                Some((found, diagnostic)) => {
                    if let Some(d) = diagnostic {
                        inner.push_diagnostic(d);
                    }
                    inner.merge_extracted(&found)?
                }
                None => Vec::new(),
            };
            let message = Message::new(
                role,
                content,
                token_cost,
                inner.scope.clone(),
                entity_refs.clone(),
            );
            let id = inner.messages.append(message)?;
            inner.budget.add(token_cost);
            inner.touch();
            debug!(message_id = %id, token_cost, total = inner.budget.token_count(), "message appended");

            let appended = Appended {
                id,
                token_cost,
                entity_refs,
                compaction: None,
            };
            (appended, inner.compaction_followup())
        };

        Ok(Appended {
            compaction: self.follow_up(followup).await?,
            ..appended
        })
    }

    /// Append a user message.
    pub async fn add_user_message(&self, content: &str) -> Result<Appended> {
        self.add_message(Role::User, content).await
    }

    /// Append an agent message.
    pub async fn add_agent_message(&self, content: &str) -> Result<Appended> {
        self.add_message(Role::Agent, content).await
    }

    /// Append a system message. System messages skip entity extraction.
    pub async fn add_system_message(&self, content: &str) -> Result<Appended> {
        self.add_message(Role::System, content).await
    }

    /// Messages visible from the active scope, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.read().await.visible_messages()
    }

    /// The last `n` visible messages.
    pub async fn get_window(&self, n: usize) -> Vec<Message> {
        let mut visible = self.messages().await;
        let start = visible.len().saturating_sub(n);
        visible.split_off(start)
    }

    /// Visible messages between two IDs, inclusive.
    pub async fn get_range(&self, from: &MessageId, to: &MessageId) -> Vec<Message> {
        let inner = self.inner.read().await;
        inner
            .messages
            .get_range(from, to)
            .iter()
            .filter(|m| inner.scope.sees(&m.agent_scope))
            .cloned()
            .collect()
    }

    // ── Entities ────────────────────────────────────────────────────────

    async fn extract(&self, text: &str) -> (Vec<ExtractedEntity>, Option<Diagnostic>) {
        let timeout = self.config.extraction_timeout;
        let failure = match tokio::time::timeout(timeout, self.deps.extractor.extract(text)).await
        {
            Ok(Ok(found)) => return (found, None),
            Ok(Err(e)) => ContextError::ExtractionFailed(e.to_string()),
            Err(_) => ContextError::ExtractionTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
        };
        warn!(error = %failure, "entity extractor failed, using pattern fallback");
        let diagnostic = Diagnostic::new(DiagnosticKind::ExtractionFallback, failure.to_string());
        (self.fallback.extract_sync(text), Some(diagnostic))
    }

    /// Extract entities from `text` and merge them into the store.
    #[instrument(skip_all)]
    pub async fn track_entities(&self, text: &str) -> Result<Vec<EntityId>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let (found, diagnostic) = self.extract(text).await;
        let mut inner = self.inner.write().await;
        if let Some(d) = diagnostic {
            inner.push_diagnostic(d);
        }
        inner.touch();
        inner.merge_extracted(&found)
    }

    /// Add or merge one entity directly. `label` is parsed leniently.
    pub async fn add_entity(&self, text: &str, label: &str, confidence: f64) -> Result<EntityId> {
        let mut inner = self.inner.write().await;
        let id = inner
            .entities
            .add_or_merge(text, EntityLabel::parse(label), confidence)?;
        inner.touch();
        Ok(id)
    }

    /// Add a directed edge between two entities.
    pub async fn relate_entities(
        &self,
        from: &EntityId,
        relation: &str,
        to: &EntityId,
    ) -> Result<bool> {
        if relation.trim().is_empty() {
            return Err(ContextError::InvalidEntity("relation name is empty".into()));
        }
        let mut inner = self.inner.write().await;
        let added = inner.entities.relate(from, relation.trim(), to)?;
        if added {
            inner.touch();
        }
        Ok(added)
    }

    /// Entities, optionally filtered by label (most recent first when filtered).
    pub async fn get_entities(&self, label: Option<&str>) -> Vec<Entity> {
        let inner = self.inner.read().await;
        match label {
            Some(raw) => inner
                .entities
                .get_by_type(EntityLabel::parse(raw))
                .into_iter()
                .cloned()
                .collect(),
            None => inner.entities.entities().values().cloned().collect(),
        }
    }

    /// Up to `limit` entities by mention count, highest first, optionally
    /// restricted to one label.
    pub async fn get_most_frequent_entities(
        &self,
        label: Option<&str>,
        limit: usize,
    ) -> Vec<Entity> {
        self.inner
            .read()
            .await
            .entities
            .most_frequent(label.map(EntityLabel::parse), limit)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Entities reachable from `id` within `max_depth` hops.
    pub async fn find_related(&self, id: &EntityId, max_depth: usize) -> Result<Vec<Entity>> {
        let inner = self.inner.read().await;
        if inner.entities.get(id).is_none() {
            return Err(ContextError::EntityNotFound(id.clone()));
        }
        Ok(inner
            .entities
            .find_related(id, max_depth)
            .into_iter()
            .cloned()
            .collect())
    }

    // ── Manual context ──────────────────────────────────────────────────

    /// Insert or overwrite a manual context item.
    ///
    /// Manual context counts toward the budget like messages do: if the total
    /// is over the threshold afterwards, the message log is compacted.
    #[instrument(skip_all, fields(label = %label))]
    pub async fn add_manual_context(
        &self,
        label: &str,
        source: &str,
        content: &str,
    ) -> Result<ManualContextSet> {
        let token_cost = self.deps.tokenizer.count_tokens(content);
        let (replaced, followup) = {
            let mut inner = self.inner.write().await;
            let previous = inner.manual.add(label, source, content, token_cost)?;
            let replaced = match previous {
                Some(old) => {
                    inner.budget.replace(old.token_cost, token_cost)?;
                    true
                }
                None => {
                    inner.budget.add(token_cost);
                    false
                }
            };
            inner.touch();
            debug!(token_cost, replaced, total = inner.budget.token_count(), "manual context set");
            (replaced, inner.compaction_followup())
        };

        Ok(ManualContextSet {
            token_cost,
            replaced,
            compaction: self.follow_up(followup).await?,
        })
    }

    /// Remove a manual context item. `false` when the label was not present.
    pub async fn remove_manual_context(&self, label: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.manual.remove(label) {
            Some(item) => {
                inner.budget.release(item.token_cost)?;
                inner.touch();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Caller state ────────────────────────────────────────────────────

    /// Store a JSON value under `key`, returning the value it replaced.
    ///
    /// Caller state is saved with the session but costs no tokens.
    pub async fn set_state(&self, key: &str, value: Value) -> Result<Option<Value>> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ContextError::InvalidStateKey("key is empty".into()));
        }
        let mut inner = self.inner.write().await;
        let previous = inner.state.insert(key.to_owned(), value);
        inner.touch();
        debug!(key, "state set");
        Ok(previous)
    }

    /// Value stored under `key`.
    pub async fn get_state(&self, key: &str) -> Option<Value> {
        self.inner.read().await.state.get(key.trim()).cloned()
    }

    /// All caller state.
    pub async fn state(&self) -> BTreeMap<String, Value> {
        self.inner.read().await.state.clone()
    }

    /// Remove one key, or every key when `key` is `None`. Returns how many
    /// entries were removed.
    pub async fn clear_state(&self, key: Option<&str>) -> usize {
        let mut inner = self.inner.write().await;
        let removed = match key {
            Some(key) => usize::from(inner.state.remove(key.trim()).is_some()),
            None => std::mem::take(&mut inner.state).len(),
        };
        if removed > 0 {
            inner.touch();
        }
        debug!(key = key.unwrap_or("*"), removed, "state cleared");
        removed
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Budget, counts, manual items, and recent entities.
    pub async fn get_context_summary(&self) -> ContextSummary {
        let inner = self.inner.read().await;
        ContextSummary {
            session_id: inner.session_id.clone(),
            agent_scope: inner.scope.clone(),
            token_count: inner.budget.token_count(),
            max_tokens: inner.budget.max_tokens(),
            usage_ratio: inner.budget.usage_ratio(),
            zone: inner.budget.zone(),
            message_count: inner.messages.iter_scope(&inner.scope).count(),
            entity_count: inner.entities.len(),
            compaction_count: inner.compactions.len(),
            compaction_phase: inner.coordinator.phase(),
            manual_items: summary::manual_summaries(inner.manual.list()),
            recent: summary::recent_entities(&inner.entities),
        }
    }

    /// Visible messages and entities ranked against `query`, limited to
    /// `max_items` and the configured token budget.
    #[allow(clippy::cast_precision_loss)]
    pub async fn get_relevant_context(&self, query: &str, max_items: usize) -> Vec<RelevantItem> {
        let inner = self.inner.read().await;
        let scorer = &self.deps.scorer;
        let mut candidates = Vec::new();

        let visible: Vec<&Message> = inner.messages.iter_scope(&inner.scope).collect();
        let n = visible.len();
        for (i, m) in visible.into_iter().enumerate() {
            let recency = (i + 1) as f64 / n as f64;
            candidates.push(RelevantItem {
                source: RelevantSource::Message {
                    id: m.id.clone(),
                    role: m.role,
                },
                text: m.content.clone(),
                score: MESSAGE_RECENCY_WEIGHT * recency + scorer.score(query, &m.content),
                token_cost: m.token_cost,
            });
        }

        let relevance = inner.entities.relevance_scores(chrono::Utc::now());
        for e in inner.entities.entities().values() {
            let base = relevance.get(&e.id).copied().unwrap_or_default();
            candidates.push(RelevantItem {
                source: RelevantSource::Entity {
                    id: e.id.clone(),
                    label: e.label,
                },
                text: e.display_text.clone(),
                score: base + scorer.score(query, &e.display_text),
                token_cost: self.deps.tokenizer.count_tokens(&e.display_text),
            });
        }

        select_within_budget(candidates, max_items, self.config.relevant_context_tokens)
    }

    /// Current total.
    pub async fn token_count(&self) -> u64 {
        self.inner.read().await.budget.token_count()
    }

    /// Lifecycle phase. `Saving` wins over `Summarizing` when both apply.
    pub async fn phase(&self) -> SessionPhase {
        if self.save_gate.try_lock().is_err() {
            return SessionPhase::Saving;
        }
        let inner = self.inner.read().await;
        if inner.coordinator.is_idle() {
            inner.phase
        } else {
            SessionPhase::Summarizing
        }
    }

    /// Whether anything changed since the last successful save or load.
    pub async fn is_dirty(&self) -> bool {
        self.inner.read().await.is_dirty()
    }

    /// Compaction coordinator phase.
    pub async fn compaction_phase(&self) -> CompactionPhase {
        self.inner.read().await.coordinator.phase()
    }

    /// Recorded warnings, oldest first.
    pub async fn diagnostics(&self) -> Vec<Diagnostic> {
        self.inner.read().await.diagnostics.clone()
    }

    /// Applied compactions, oldest first.
    pub async fn compactions(&self) -> Vec<CompactionRecord> {
        self.inner.read().await.compactions.clone()
    }

    /// Session ID.
    pub async fn session_id(&self) -> SessionId {
        self.inner.read().await.session_id.clone()
    }

    /// Active scope.
    pub async fn agent_scope(&self) -> AgentScope {
        self.inner.read().await.scope.clone()
    }

    /// Recount every component and compare with the cached total.
    pub async fn verify_accounting(&self) -> Result<()> {
        let inner = self.inner.read().await;
        inner.budget.verify(inner.component_total())
    }

    // ── Scopes ──────────────────────────────────────────────────────────

    /// Switch the active scope. Entities and manual context are shared by
    /// all scopes; only the message view changes.
    pub async fn switch_agent_scope(&self, name: &str) -> Result<AgentScope> {
        let scope = AgentScope::new(name)?;
        let mut inner = self.inner.write().await;
        if inner.scope != scope {
            info!(from = %inner.scope, to = %scope, "agent scope switched");
            inner.scope = scope.clone();
            inner.touch();
        }
        Ok(scope)
    }

    // ── Compaction ──────────────────────────────────────────────────────

    async fn follow_up(&self, followup: Followup) -> Result<Option<CompactionOutcome>> {
        match followup {
            Followup::Nothing => Ok(None),
            Followup::InFlight => Ok(Some(CompactionOutcome::Skipped(SkipReason::InFlight))),
            Followup::Compact => self.trigger_compaction().await.map(Some),
        }
    }

    async fn trigger_compaction(&self) -> Result<CompactionOutcome> {
        match self.config.mode {
            CompactionMode::Inline => self.run_compaction(false).await,
            CompactionMode::Background => {
                let session = self.clone();
                let task = tokio::spawn(async move {
                    if let Err(e) = session.run_compaction(false).await {
                        warn!(error = %e, "background compaction failed");
                    }
                });
                let mut tasks = self.background.lock();
                tasks.retain(|t| !t.is_finished());
                tasks.push(task);
                Ok(CompactionOutcome::Scheduled)
            }
        }
    }

    /// Wait until every scheduled background compaction has finished,
    /// including any scheduled while waiting.
    pub async fn wait_idle(&self) {
        loop {
            let pending = std::mem::take(&mut *self.background.lock());
            if pending.is_empty() {
                return;
            }
            for task in pending {
                if let Err(e) = task.await {
                    warn!(error = %e, "background compaction task did not complete");
                }
            }
        }
    }

    /// Compact now, regardless of the threshold.
    ///
    /// Unlike a threshold trigger, exhausting the summarizer's attempts is
    /// returned as [`ContextError::SummarizationFailure`].
    pub async fn compact_now(&self) -> Result<CompactionOutcome> {
        match self.run_compaction(true).await? {
            CompactionOutcome::Failed { attempts, error } => {
                Err(ContextError::SummarizationFailure {
                    attempts,
                    message: error,
                })
            }
            outcome => Ok(outcome),
        }
    }

    #[instrument(skip_all, fields(force = force))]
    async fn run_compaction(&self, force: bool) -> Result<CompactionOutcome> {
        let plan = {
            let mut inner = self.inner.write().await;
            if !inner.coordinator.is_idle() {
                return Ok(CompactionOutcome::Skipped(SkipReason::InFlight));
            }
            if !force && !inner.budget.over_threshold() {
                return Ok(CompactionOutcome::Skipped(SkipReason::UnderThreshold));
            }
            inner.coordinator.transition(CompactionPhase::ThresholdExceeded)?;
            let Some(plan) = inner.plan_compaction(self.config.preserve_recent) else {
                inner.coordinator.transition(CompactionPhase::Idle)?;
                debug!("nothing outside the protected tail to compact");
                return Ok(CompactionOutcome::Skipped(SkipReason::NothingToCompact));
            };
            inner.coordinator.transition(CompactionPhase::Summarizing)?;
            plan
        };

        let guard = AbandonGuard::new(Arc::clone(&self.inner), plan.epoch);
        let outcome = self.finish_compaction(&plan).await;
        guard.disarm();
        outcome
    }

    /// Summarize the planned window and swap it in. Every return leaves the
    /// coordinator `Idle` (or belongs to a reloaded session).
    async fn finish_compaction(&self, plan: &CompactionPlan) -> Result<CompactionOutcome> {
        let summarized = summarize_with_retry(
            self.deps.summarizer.as_ref(),
            &plan.window,
            &plan.entities,
            &self.config.retry,
            self.config.summary_timeout,
        )
        .await;

        let mut inner = self.inner.write().await;
        if inner.epoch != plan.epoch {
            debug!("session reloaded during summarization, discarding summary");
            return Ok(CompactionOutcome::Skipped(SkipReason::Invalidated));
        }

        let text = match summarized {
            Ok(text) => text,
            Err(ContextError::SummarizationFailure { attempts, message }) => {
                inner.coordinator.transition(CompactionPhase::Failed)?;
                inner.coordinator.transition(CompactionPhase::Idle)?;
                warn!(attempts, error = %message, "compaction failed, window left untouched");
                inner.push_diagnostic(Diagnostic::new(
                    DiagnosticKind::SummarizationFailed,
                    format!("{attempts} attempt(s): {message}"),
                ));
                return Ok(CompactionOutcome::Failed {
                    attempts,
                    error: message,
                });
            }
            Err(e) => {
                inner.coordinator.transition(CompactionPhase::Failed)?;
                inner.coordinator.transition(CompactionPhase::Idle)?;
                return Err(e);
            }
        };

        let summary_cost = self.deps.tokenizer.count_tokens(&text);
        if summary_cost >= plan.window_cost {
            inner.coordinator.transition(CompactionPhase::Idle)?;
            warn!(
                summary_cost,
                window_cost = plan.window_cost,
                "summary is not smaller than its window, discarding"
            );
            inner.push_diagnostic(Diagnostic::new(
                DiagnosticKind::SummaryRejected,
                format!(
                    "summary cost {summary_cost} >= window cost {}",
                    plan.window_cost
                ),
            ));
            return Ok(CompactionOutcome::Skipped(SkipReason::NotSmaller));
        }

        match inner.apply_compaction(plan, text, summary_cost, self.config.entity_prune_threshold) {
            Ok(record) => {
                inner.coordinator.transition(CompactionPhase::Idle)?;
                info!(
                    tokens_before = record.tokens_before,
                    tokens_after = record.tokens_after,
                    messages_replaced = record.messages_replaced,
                    entities_pruned = record.entities_pruned,
                    "context compacted"
                );
                Ok(CompactionOutcome::Compacted(record))
            }
            Err(e) => {
                inner.coordinator.transition(CompactionPhase::Failed)?;
                inner.coordinator.transition(CompactionPhase::Idle)?;
                Err(e)
            }
        }
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Current state as a versioned record.
    pub async fn snapshot(&self) -> VersionedRecord {
        VersionedRecord::current(self.inner.read().await.to_state())
    }

    /// Replace all state with `record`. Invalidates any in-flight compaction
    /// and leaves the session clean.
    pub async fn restore(&self, record: VersionedRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let epoch = inner.epoch + 1;
        *inner = SessionInner::from_state(record.state, Arc::clone(&self.deps.tokenizer), epoch)?;
        Ok(())
    }

    /// Write a snapshot to the backing store.
    ///
    /// Concurrent saves run one at a time, in the order they reach the gate,
    /// so the store always ends up holding the latest snapshot. The session
    /// lock is only held while the snapshot is taken. Failures are recorded
    /// as diagnostics and returned, and never touch the in-memory state.
    #[instrument(skip_all, fields(location = %self.deps.store.describe()))]
    pub async fn save(&self) -> Result<()> {
        let _gate = self.save_gate.lock().await;
        let (record, epoch, revision) = {
            let inner = self.inner.read().await;
            let record = VersionedRecord::current(inner.to_state());
            (record, inner.epoch, inner.revision())
        };

        let written = match persistence::encode(&record) {
            Ok(bytes) => {
                let store = Arc::clone(&self.deps.store);
                tokio::task::spawn_blocking(move || store.write_atomic(&bytes))
                    .await
                    .map_err(|e| {
                        ContextError::ConcurrentMutationConflict(format!("save task failed: {e}"))
                    })
                    .and_then(std::convert::identity)
            }
            Err(e) => Err(e),
        };

        match &written {
            Ok(()) => {
                self.inner.write().await.mark_saved(epoch, revision);
                info!(
                    messages = record.state.messages.len(),
                    entities = record.state.entities.len(),
                    token_count = record.state.token_count,
                    "session saved"
                );
            }
            Err(e) => {
                warn!(error = %e, "session save failed");
                self.inner.write().await.push_diagnostic(Diagnostic::new(
                    DiagnosticKind::PersistenceFailed,
                    e.to_string(),
                ));
            }
        }
        written
    }

    /// Save only if something changed since the last save or load.
    /// Returns whether a save was attempted.
    pub async fn save_if_dirty(&self) -> Result<bool> {
        if !self.is_dirty().await {
            return Ok(false);
        }
        self.save().await.map(|()| true)
    }

    /// Load the stored snapshot, if any. Returns `false` when the store is empty.
    ///
    /// Corrupt or unmigratable data fails closed and leaves the live session as it was.
    #[instrument(skip_all, fields(location = %self.deps.store.describe()))]
    pub async fn load(&self) -> Result<bool> {
        let store = Arc::clone(&self.deps.store);
        let bytes = tokio::task::spawn_blocking(move || store.read())
            .await
            .map_err(|e| ContextError::ConcurrentMutationConflict(format!("load task failed: {e}")))??;
        let Some(bytes) = bytes else {
            debug!("no stored session");
            return Ok(false);
        };
        let record = persistence::decode(&bytes)?;
        let messages = record.state.messages.len();
        self.restore(record).await?;
        info!(messages, "session loaded");
        Ok(true)
    }
}

/// Hands the coordinator back to `Idle` if a compaction run is dropped
/// before its own final transition.
struct AbandonGuard {
    inner: Arc<RwLock<SessionInner>>,
    epoch: u64,
    armed: bool,
}

impl AbandonGuard {
    fn new(inner: Arc<RwLock<SessionInner>>, epoch: u64) -> Self {
        Self {
            inner,
            epoch,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let epoch = self.epoch;
        if let Ok(mut inner) = self.inner.try_write() {
            abandon(&mut inner, epoch);
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("compaction dropped outside a runtime, coordinator left busy");
            return;
        };
        let shared = Arc::clone(&self.inner);
        let _ = runtime.spawn(async move {
            abandon(&mut *shared.write().await, epoch);
        });
    }
}

fn abandon(inner: &mut SessionInner, epoch: u64) {
    if inner.epoch == epoch {
        warn!(phase = %inner.coordinator.phase(), "compaction dropped before completion");
        inner.coordinator.abandon();
    }
}
