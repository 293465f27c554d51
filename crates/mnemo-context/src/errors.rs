//! Error types for session state management.

use mnemo_core::ids::EntityId;
use thiserror::Error;

/// Errors raised by the context components and the session facade.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Entity text or confidence was unusable.
    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    /// Message content was empty or the role is not allowed here.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Manual context label or content was empty.
    #[error("invalid manual context: {0}")]
    InvalidManualContext(String),

    /// Agent scope name was empty.
    #[error("invalid agent scope: {0}")]
    InvalidScope(String),

    /// Caller state key was empty.
    #[error("invalid state key: {0}")]
    InvalidStateKey(String),

    /// Referenced entity does not exist.
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    /// The extractor did not answer in time.
    #[error("entity extraction timed out after {timeout_ms}ms")]
    ExtractionTimeout {
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// The extractor returned an error.
    #[error("entity extraction failed: {0}")]
    ExtractionFailed(String),

    /// Every summarization attempt failed.
    #[error("summarization failed after {attempts} attempt(s): {message}")]
    SummarizationFailure {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        message: String,
    },

    /// Stored session data could not be parsed or failed validation.
    #[error("session data is corrupt: {0}")]
    PersistenceCorruption(String),

    /// Stored schema version cannot be migrated to the current one.
    #[error("unsupported schema version {found} (supported {min}..={supported})")]
    VersionMismatch {
        /// Version found in the record.
        found: u32,
        /// Oldest migratable version.
        min: u32,
        /// Current version.
        supported: u32,
    },

    /// Internal state changed under an operation that assumed exclusivity.
    #[error("concurrent mutation conflict: {0}")]
    ConcurrentMutationConflict(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ContextError {
    /// Short category name for logs and diagnostics.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidEntity(_)
            | Self::InvalidMessage(_)
            | Self::InvalidManualContext(_)
            | Self::InvalidScope(_)
            | Self::InvalidStateKey(_)
            | Self::EntityNotFound(_) => "input",
            Self::ExtractionTimeout { .. } | Self::ExtractionFailed(_) => "extraction",
            Self::SummarizationFailure { .. } => "summarization",
            Self::PersistenceCorruption(_)
            | Self::VersionMismatch { .. }
            | Self::Io(_)
            | Self::Serialization(_) => "persistence",
            Self::ConcurrentMutationConflict(_) => "internal",
        }
    }

    /// Whether the live session is still usable after this error.
    ///
    /// Only a mutation conflict indicates broken internal state.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ConcurrentMutationConflict(_))
    }
}

/// Result type for context operations.
pub type Result<T> = std::result::Result<T, ContextError>;
