//! Token counting and the running session total.
//!
//! The total is maintained incrementally: every mutation that adds or
//! removes a costed item adjusts it by exactly that item's cost. Nothing
//! rescans the log on the hot path; [`TokenBudget::verify`] exists to check
//! the cached value against a full recount.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::{CHARS_PER_TOKEN, Thresholds};
use crate::errors::{ContextError, Result};

/// Counts tokens in text. Must be deterministic per input.
#[cfg_attr(test, mockall::automock)]
pub trait Tokenizer: Send + Sync {
    /// Token count for `text`.
    fn count_tokens(&self, text: &str) -> u64;
}

/// `ceil(chars / 4)` estimate; zero for empty text.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count_tokens(&self, text: &str) -> u64 {
        let chars = text.chars().count();
        u64::try_from(chars.div_ceil(CHARS_PER_TOKEN)).unwrap_or(u64::MAX)
    }
}

/// Coarse usage level reported in context summaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetZone {
    /// Below [`Thresholds::WARNING`].
    Normal,
    /// Below [`Thresholds::ALERT`].
    Warning,
    /// Below [`Thresholds::CRITICAL`].
    Alert,
    /// At or above [`Thresholds::CRITICAL`].
    Critical,
}

impl fmt::Display for BudgetZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Alert => "alert",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Running token total plus the threshold that triggers compaction.
#[derive(Clone)]
pub struct TokenBudget {
    tokenizer: Arc<dyn Tokenizer>,
    token_count: u64,
    max_tokens: u64,
    summarization_ratio: f64,
}

impl fmt::Debug for TokenBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBudget")
            .field("token_count", &self.token_count)
            .field("max_tokens", &self.max_tokens)
            .field("summarization_ratio", &self.summarization_ratio)
            .finish_non_exhaustive()
    }
}

impl TokenBudget {
    /// Empty budget.
    pub fn new(tokenizer: Arc<dyn Tokenizer>, max_tokens: u64, summarization_ratio: f64) -> Self {
        Self {
            tokenizer,
            token_count: 0,
            max_tokens,
            summarization_ratio,
        }
    }

    /// Budget resumed at a known total.
    pub fn with_total(mut self, token_count: u64) -> Self {
        self.token_count = token_count;
        self
    }

    /// Delegate to the tokenizer.
    pub fn count_tokens(&self, text: &str) -> u64 {
        self.tokenizer.count_tokens(text)
    }

    /// Current total.
    pub fn token_count(&self) -> u64 {
        self.token_count
    }

    /// Budget ceiling.
    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    /// Trigger ratio.
    pub fn summarization_ratio(&self) -> f64 {
        self.summarization_ratio
    }

    /// Account for an added item.
    pub fn add(&mut self, cost: u64) {
        self.token_count = self.token_count.saturating_add(cost);
    }

    /// Account for a removed item. Removing more than the total means the
    /// cache has drifted from the components.
    pub fn release(&mut self, cost: u64) -> Result<()> {
        self.token_count = self.token_count.checked_sub(cost).ok_or_else(|| {
            ContextError::ConcurrentMutationConflict(format!(
                "releasing {cost} tokens from a total of {}",
                self.token_count
            ))
        })?;
        Ok(())
    }

    /// Swap one cost for another in a single step.
    pub fn replace(&mut self, removed: u64, added: u64) -> Result<()> {
        if removed > self.token_count {
            return Err(ContextError::ConcurrentMutationConflict(format!(
                "replacing {removed} tokens from a total of {}",
                self.token_count
            )));
        }
        self.token_count = self.token_count - removed + added;
        Ok(())
    }

    /// `max_tokens * summarization_ratio`.
    #[allow(clippy::cast_precision_loss)]
    pub fn threshold(&self) -> f64 {
        self.max_tokens as f64 * self.summarization_ratio
    }

    /// Whether the total is strictly above the threshold.
    #[allow(clippy::cast_precision_loss)]
    pub fn over_threshold(&self) -> bool {
        self.token_count as f64 > self.threshold()
    }

    /// `token_count / max_tokens`.
    #[allow(clippy::cast_precision_loss)]
    pub fn usage_ratio(&self) -> f64 {
        if self.max_tokens == 0 {
            return 1.0;
        }
        self.token_count as f64 / self.max_tokens as f64
    }

    /// Tokens left before the ceiling.
    pub fn headroom(&self) -> u64 {
        self.max_tokens.saturating_sub(self.token_count)
    }

    /// Usage zone.
    pub fn zone(&self) -> BudgetZone {
        let ratio = self.usage_ratio();
        if ratio >= Thresholds::CRITICAL {
            BudgetZone::Critical
        } else if ratio >= Thresholds::ALERT {
            BudgetZone::Alert
        } else if ratio >= Thresholds::WARNING {
            BudgetZone::Warning
        } else {
            BudgetZone::Normal
        }
    }

    /// Compare the cached total with a full recount.
    pub fn verify(&self, expected: u64) -> Result<()> {
        if self.token_count == expected {
            Ok(())
        } else {
            Err(ContextError::ConcurrentMutationConflict(format!(
                "token_count {} does not match component total {expected}",
                self.token_count
            )))
        }
    }
}
