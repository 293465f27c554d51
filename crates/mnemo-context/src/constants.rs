//! Context subsystem constants.

// =============================================================================
// Token Estimation
// =============================================================================

/// Approximate characters per token for the heuristic tokenizer.
pub const CHARS_PER_TOKEN: usize = 4;

// =============================================================================
// Budget Zones
// =============================================================================

/// Usage ratios at which the budget moves into a higher zone.
pub struct Thresholds;

impl Thresholds {
    /// Warning zone starts here.
    pub const WARNING: f64 = 0.50;
    /// Alert zone starts here.
    pub const ALERT: f64 = 0.70;
    /// Critical zone starts here.
    pub const CRITICAL: f64 = 0.85;
}

// =============================================================================
// Entity Relevance
// =============================================================================

/// Weight of the normalized mention count.
pub const RELEVANCE_MENTION_WEIGHT: f64 = 0.4;

/// Weight of the recency decay.
pub const RELEVANCE_RECENCY_WEIGHT: f64 = 0.4;

/// Weight of the normalized relationship count.
pub const RELEVANCE_RELATIONSHIP_WEIGHT: f64 = 0.2;

/// Half-life of the recency decay, in seconds.
pub const RECENCY_HALF_LIFE_SECS: f64 = 3_600.0;

/// Relation name for entities extracted from the same text.
pub const RELATION_MENTIONED_WITH: &str = "mentioned_with";

/// Maximum co-mention edges added per entity per extraction.
pub const MAX_CO_MENTION_EDGES: usize = 8;

// =============================================================================
// Retrieval
// =============================================================================

/// Weight of positional recency when ranking messages.
pub const MESSAGE_RECENCY_WEIGHT: f64 = 0.5;

// =============================================================================
// Agent Scopes
// =============================================================================

/// Scope whose messages are visible from every other scope.
pub const SHARED_SCOPE: &str = "shared";

/// Scope a fresh session starts in.
pub const DEFAULT_SCOPE: &str = "default";

// =============================================================================
// Persistence
// =============================================================================

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 3;

/// Oldest schema version the migration table can upgrade.
pub const MIN_SCHEMA_VERSION: u32 = 1;

// =============================================================================
// Diagnostics / Summaries
// =============================================================================

/// Diagnostics kept per session; older ones are dropped.
pub const MAX_DIAGNOSTICS: usize = 50;

/// Per-message character cap in the extractive summarizer.
pub const EXTRACTIVE_SENTENCE_MAX_CHARS: usize = 160;

/// Entities named at the end of an extractive summary.
pub const EXTRACTIVE_MAX_ENTITIES: usize = 10;

/// Entries per label in the context summary's "recent" lists.
pub const SUMMARY_RECENT_PER_LABEL: usize = 3;
