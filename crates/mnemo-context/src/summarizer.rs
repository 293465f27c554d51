//! Summarization seam and the compaction coordinator.
//!
//! The coordinator owns the compaction state machine:
//!
//! ```text
//! Idle → ThresholdExceeded → Summarizing → Idle
//!                  │               └──→ Failed → Idle
//!                  └──→ Idle   (nothing to compact)
//! ```
//!
//! The external summarizer call runs through [`summarize_with_retry`]:
//! each attempt is bounded by a timeout, failures back off exponentially,
//! and exhaustion yields [`ContextError::SummarizationFailure`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use mnemo_core::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{EXTRACTIVE_MAX_ENTITIES, EXTRACTIVE_SENTENCE_MAX_CHARS};
use crate::errors::{ContextError, Result};
use crate::types::{CompactionRecord, Entity, Message};

/// Produces a summary of a window of messages.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `messages`; `entities` are the ones those messages reference.
    async fn summarize(
        &self,
        messages: &[Message],
        entities: &[Entity],
    ) -> std::result::Result<String, Box<dyn std::error::Error + Send + Sync>>;
}

// =============================================================================
// Extractive summarizer
// =============================================================================

/// Deterministic local summarizer: the first sentence of each message,
/// followed by the names of the referenced entities.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtractiveSummarizer;

fn first_sentence(text: &str) -> &str {
    let text = text.trim();
    let end = text
        .char_indices()
        .find(|&(_, c)| matches!(c, '.' | '!' | '?' | '\n'))
        .map_or(text.len(), |(i, c)| i + c.len_utf8());
    let sentence = text[..end].trim();
    match sentence.char_indices().nth(EXTRACTIVE_SENTENCE_MAX_CHARS) {
        Some((cut, _)) => &sentence[..cut],
        None => sentence,
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(
        &self,
        messages: &[Message],
        entities: &[Entity],
    ) -> std::result::Result<String, Box<dyn std::error::Error + Send + Sync>> {
        if messages.is_empty() {
            return Err("nothing to summarize".into());
        }
        let mut lines: Vec<String> = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, first_sentence(&m.content)))
            .collect();
        if !entities.is_empty() {
            let names: Vec<&str> = entities
                .iter()
                .take(EXTRACTIVE_MAX_ENTITIES)
                .map(|e| e.display_text.as_str())
                .collect();
            lines.push(format!("Entities: {}", names.join(", ")));
        }
        Ok(lines.join("\n"))
    }
}

// =============================================================================
// Coordinator state
// =============================================================================

/// Compaction state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionPhase {
    /// No compaction in progress.
    #[default]
    Idle,
    /// Threshold crossed; window being selected.
    ThresholdExceeded,
    /// External summarizer call in flight.
    Summarizing,
    /// All attempts failed; about to return to idle.
    Failed,
}

impl fmt::Display for CompactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::ThresholdExceeded => "threshold_exceeded",
            Self::Summarizing => "summarizing",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a compaction trigger did nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Another compaction is already running.
    InFlight,
    /// The total is not above the threshold.
    UnderThreshold,
    /// Fewer than two messages lie outside the protected tail.
    NothingToCompact,
    /// The summary cost at least as much as the window.
    NotSmaller,
    /// The session was reloaded while the summarizer was running.
    Invalidated,
}

/// Result of one compaction trigger.
#[derive(Clone, Debug, PartialEq)]
pub enum CompactionOutcome {
    /// The window was replaced by a summary.
    Compacted(CompactionRecord),
    /// Nothing changed.
    Skipped(SkipReason),
    /// Every attempt failed; nothing changed.
    Failed {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        error: String,
    },
    /// Handed to a background task.
    Scheduled,
}

impl CompactionOutcome {
    /// Whether the window was replaced.
    pub fn is_compacted(&self) -> bool {
        matches!(self, Self::Compacted(_))
    }
}

/// Holds the compaction phase and enforces legal transitions.
#[derive(Clone, Debug, Default)]
pub struct CompactionCoordinator {
    phase: CompactionPhase,
}

impl CompactionCoordinator {
    /// Current phase.
    pub fn phase(&self) -> CompactionPhase {
        self.phase
    }

    /// Whether a new compaction may start.
    pub fn is_idle(&self) -> bool {
        self.phase == CompactionPhase::Idle
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: CompactionPhase) -> Result<()> {
        use CompactionPhase::{Failed, Idle, Summarizing, ThresholdExceeded};
        let allowed = matches!(
            (self.phase, next),
            (Idle, ThresholdExceeded)
                | (ThresholdExceeded, Summarizing | Idle)
                | (Summarizing, Idle | Failed)
                | (Failed, Idle)
        );
        if !allowed {
            return Err(ContextError::ConcurrentMutationConflict(format!(
                "illegal compaction transition {} -> {next}",
                self.phase
            )));
        }
        debug!(from = %self.phase, to = %next, "compaction phase");
        self.phase = next;
        Ok(())
    }

    /// Return to `Idle` from any phase, for a run that ended without
    /// reaching its own transition (cancelled or panicked).
    pub fn abandon(&mut self) {
        if self.phase != CompactionPhase::Idle {
            debug!(from = %self.phase, "compaction abandoned");
            self.phase = CompactionPhase::Idle;
        }
    }
}

// =============================================================================
// Retry loop
// =============================================================================

/// Call the summarizer until it succeeds or `retry.max_attempts` is exhausted.
///
/// Each attempt is cut off after `timeout`. An empty summary counts as a
/// failure. Backoff sleeps use `tokio::time`, so paused-clock tests run instantly.
pub async fn summarize_with_retry(
    summarizer: &dyn Summarizer,
    messages: &[Message],
    entities: &[Entity],
    retry: &RetryConfig,
    timeout: Duration,
) -> Result<String> {
    let attempts = retry.attempts();
    let mut last_error = String::new();

    for attempt in 0..attempts {
        let outcome = tokio::time::timeout(timeout, summarizer.summarize(messages, entities)).await;
        match outcome {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                debug!(attempt = attempt + 1, "summarizer succeeded");
                return Ok(text);
            }
            Ok(Ok(_)) => last_error = "summarizer returned an empty summary".into(),
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => {
                last_error = format!(
                    "summarizer timed out after {}ms",
                    timeout.as_millis()
                );
            }
        }

        if attempt + 1 < attempts {
            let delay = retry.delay_after(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %last_error,
                "summarization attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    Err(ContextError::SummarizationFailure {
        attempts,
        message: last_error,
    })
}
