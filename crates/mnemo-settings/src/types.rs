//! Settings types.
//!
//! Every struct uses `#[serde(rename_all = "camelCase", default)]` so a
//! partial user file only needs the keys it overrides.

use std::path::PathBuf;

use mnemo_core::retry::RetryConfig;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MnemoSettings {
    /// Settings file format version.
    pub version: u32,
    /// Token budget.
    pub budget: BudgetSettings,
    /// Compaction (summarization) behaviour.
    pub compaction: CompactionSettings,
    /// Entity extraction.
    pub extraction: ExtractionSettings,
    /// Relevant-context retrieval.
    pub retrieval: RetrievalSettings,
    /// Session file location.
    pub persistence: PersistenceSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl Default for MnemoSettings {
    fn default() -> Self {
        Self {
            version: 1,
            budget: BudgetSettings::default(),
            compaction: CompactionSettings::default(),
            extraction: ExtractionSettings::default(),
            retrieval: RetrievalSettings::default(),
            persistence: PersistenceSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl MnemoSettings {
    /// Check ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.budget.max_tokens == 0 {
            return Err(SettingsError::InvalidValue(
                "budget.maxTokens must be positive".into(),
            ));
        }
        let ratio = self.budget.summarization_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(SettingsError::InvalidValue(format!(
                "budget.summarizationRatio must be in (0, 1], got {ratio}"
            )));
        }
        if self.compaction.timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "compaction.timeoutMs must be positive".into(),
            ));
        }
        if self.compaction.retry.max_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "compaction.retry.maxAttempts must be at least 1".into(),
            ));
        }
        let prune = self.compaction.entity_prune_threshold;
        if !(0.0..=1.0).contains(&prune) {
            return Err(SettingsError::InvalidValue(format!(
                "compaction.entityPruneThreshold must be in [0, 1], got {prune}"
            )));
        }
        if self.extraction.timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "extraction.timeoutMs must be positive".into(),
            ));
        }
        if self.persistence.autosave_interval_ms == Some(0) {
            return Err(SettingsError::InvalidValue(
                "persistence.autosaveIntervalMs must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

/// Token budget settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetSettings {
    /// Maximum tokens the session may hold.
    pub max_tokens: u64,
    /// Fraction of `max_tokens` above which compaction triggers.
    pub summarization_ratio: f64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            max_tokens: 180_000,
            summarization_ratio: 0.8,
        }
    }
}

/// How a triggered compaction is run relative to the mutation that triggered it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionMode {
    /// The mutation awaits the compaction attempt.
    #[default]
    Inline,
    /// A background task runs the compaction.
    Background,
}

/// Compaction settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompactionSettings {
    /// Most recent messages kept verbatim.
    pub preserve_recent: usize,
    /// Per-attempt summarizer timeout in milliseconds.
    pub timeout_ms: u64,
    /// Inline or background execution.
    pub mode: CompactionMode,
    /// Entities below this relevance may be pruned with their window.
    pub entity_prune_threshold: f64,
    /// Attempt count and backoff between summarizer attempts.
    pub retry: RetryConfig,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            preserve_recent: 10,
            timeout_ms: 30_000,
            mode: CompactionMode::Inline,
            entity_prune_threshold: 0.2,
            retry: RetryConfig::default(),
        }
    }
}

/// Entity extraction settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionSettings {
    /// Extractor call timeout in milliseconds.
    pub timeout_ms: u64,
    /// Run extraction on every user and agent message.
    pub track_messages: bool,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            track_messages: true,
        }
    }
}

/// Relevant-context retrieval settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrievalSettings {
    /// Token budget for one `get_relevant_context` result.
    pub relevant_context_tokens: u64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            relevant_context_tokens: 2_000,
        }
    }
}

/// Session file settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceSettings {
    /// Explicit session file path. Defaults to `~/.mnemo/session.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_path: Option<String>,
    /// Autosave period for embedders that run one. Unset means no autosave.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autosave_interval_ms: Option<u64>,
}

impl PersistenceSettings {
    /// The configured path, or the default under the home directory.
    pub fn resolved_path(&self) -> PathBuf {
        match &self.session_path {
            Some(p) => PathBuf::from(p),
            None => crate::loader::mnemo_home().join("session.json"),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Filter directive passed to the subscriber (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of the compact text format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".into(),
            json: false,
        }
    }
}
