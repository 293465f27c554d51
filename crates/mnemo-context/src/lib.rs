//! # mnemo-context
//!
//! Session state for a conversational agent: what has been said, what it
//! was about, and how much of the token budget it costs.
//!
//! - **Entity store**: deduplicated entities with merge-on-mention and a relationship graph
//! - **Message log**: ordered history, only shrunk by an atomic compaction swap
//! - **Manual context**: user-labeled context chunks, upserted by label
//! - **Token budget**: incrementally maintained total and threshold check
//! - **Summarizer coordinator**: threshold-triggered compaction with retry and backoff
//! - **Persistence**: versioned snapshots, atomic file writes, schema migration
//! - **Session**: the facade composing all of the above behind one lock

#![deny(unsafe_code)]

pub mod constants;
pub mod entity_store;
pub mod errors;
pub mod extraction;
pub mod manual_context;
pub mod message_log;
pub mod persistence;
pub mod relevance;
pub mod session;
pub mod summarizer;
pub mod token_budget;
pub mod types;

pub use errors::{ContextError, Result};
pub use extraction::{EntityExtractor, ExtractedEntity, PatternExtractor};
pub use persistence::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore, VersionedRecord};
pub use relevance::{LexicalScorer, RelevantItem, RelevantSource, SemanticScorer};
pub use session::{
    Appended, AutosaveHandle, ContextSummary, ManualContextSet, ManualItemSummary,
    RecentEntities, Session, SessionConfig, SessionDeps, SessionPhase,
};
pub use summarizer::{
    CompactionOutcome, CompactionPhase, ExtractiveSummarizer, SkipReason, Summarizer,
};
pub use token_budget::{BudgetZone, HeuristicTokenizer, Tokenizer};
pub use types::*;
