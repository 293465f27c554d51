//! Ranking messages and entities against a query.

use std::collections::HashSet;

use mnemo_core::ids::{EntityId, MessageId};
use serde::{Deserialize, Serialize};

use crate::types::{EntityLabel, Role};

/// Scores how well `candidate` matches `query`, in `[0, 1]`.
pub trait SemanticScorer: Send + Sync {
    /// Match score.
    fn score(&self, query: &str, candidate: &str) -> f64;
}

/// Jaccard overlap of lowercase alphanumeric word sets.
#[derive(Clone, Copy, Debug, Default)]
pub struct LexicalScorer;

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl SemanticScorer for LexicalScorer {
    #[allow(clippy::cast_precision_loss)]
    fn score(&self, query: &str, candidate: &str) -> f64 {
        let q = words(query);
        let c = words(candidate);
        if q.is_empty() || c.is_empty() {
            return 0.0;
        }
        let shared = q.intersection(&c).count();
        let union = q.union(&c).count();
        shared as f64 / union as f64
    }
}

/// What a [`RelevantItem`] points at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelevantSource {
    /// A message in the log.
    Message {
        /// Message ID.
        id: MessageId,
        /// Author.
        role: Role,
    },
    /// A tracked entity.
    Entity {
        /// Entity ID.
        id: EntityId,
        /// Label.
        label: EntityLabel,
    },
}

/// One ranked result of `get_relevant_context`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelevantItem {
    /// Origin.
    pub source: RelevantSource,
    /// Message content or entity display text.
    pub text: String,
    /// Combined score.
    pub score: f64,
    /// Token cost of `text`.
    pub token_cost: u64,
}

/// Sort by score (highest first) and keep items while they fit in
/// `token_budget` and `max_items`. Items that do not fit are skipped so a
/// smaller, lower-ranked item can still be taken.
pub fn select_within_budget(
    mut candidates: Vec<RelevantItem>,
    max_items: usize,
    token_budget: u64,
) -> Vec<RelevantItem> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut used = 0_u64;
    let mut picked = Vec::new();
    for item in candidates {
        if picked.len() >= max_items {
            break;
        }
        if used + item.token_cost > token_budget {
            continue;
        }
        used += item.token_cost;
        picked.push(item);
    }
    picked
}
