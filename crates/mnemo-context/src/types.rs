//! Shared data model: entities, messages, manual context, and the
//! serializable session state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use mnemo_core::ids::{EntityId, MessageId, SessionId};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_SCOPE, SHARED_SCOPE};
use crate::errors::{ContextError, Result};

// =============================================================================
// Entity labels
// =============================================================================

/// Closed set of entity labels.
///
/// Unknown labels parse to [`EntityLabel::Other`]; parsing never fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityLabel {
    /// A person.
    Person,
    /// A company, agency, or institution.
    Organization,
    /// A place.
    Location,
    /// A named product.
    Product,
    /// A building or facility.
    Building,
    /// A nationality, religious, or political group.
    Group,
    /// A book, song, or other work.
    CreativeWork,
    /// A date.
    Date,
    /// A time of day.
    Time,
    /// A monetary amount.
    Money,
    /// A percentage.
    Percent,
    /// A programming language.
    ProgrammingLanguage,
    /// A library or framework.
    Framework,
    /// A database system.
    Database,
    /// A file path.
    File,
    /// A URL.
    Url,
    /// A shell command.
    Command,
    /// A search request.
    SearchQuery,
    /// A unit of work the user asked for.
    Task,
    /// An HTTP endpoint.
    ApiEndpoint,
    /// An error message.
    ErrorMessage,
    /// A design pattern.
    DesignPattern,
    /// An architecture concept.
    ArchitectureConcept,
    /// Anything else.
    #[serde(other)]
    Other,
}

impl EntityLabel {
    /// Every label, in declaration order.
    pub const ALL: [Self; 24] = [
        Self::Person,
        Self::Organization,
        Self::Location,
        Self::Product,
        Self::Building,
        Self::Group,
        Self::CreativeWork,
        Self::Date,
        Self::Time,
        Self::Money,
        Self::Percent,
        Self::ProgrammingLanguage,
        Self::Framework,
        Self::Database,
        Self::File,
        Self::Url,
        Self::Command,
        Self::SearchQuery,
        Self::Task,
        Self::ApiEndpoint,
        Self::ErrorMessage,
        Self::DesignPattern,
        Self::ArchitectureConcept,
        Self::Other,
    ];

    /// Parse a label name or NER tag, case-insensitively.
    ///
    /// Accepts snake_case names (`search_query`), spaced or hyphenated forms,
    /// and the usual NER tags (`PERSON`, `ORG`, `GPE`, `LOC`, `FAC`, `NORP`,
    /// `WORK_OF_ART`, `LANGUAGE`, ...).
    pub fn parse(raw: &str) -> Self {
        let key = raw.trim().to_lowercase().replace([' ', '-'], "_");
        match key.as_str() {
            "person" | "per" => Self::Person,
            "organization" | "organisation" | "org" => Self::Organization,
            "location" | "loc" | "gpe" => Self::Location,
            "product" => Self::Product,
            "building" | "fac" | "facility" => Self::Building,
            "group" | "norp" => Self::Group,
            "creative_work" | "work_of_art" => Self::CreativeWork,
            "date" => Self::Date,
            "time" => Self::Time,
            "money" => Self::Money,
            "percent" => Self::Percent,
            "programming_language" | "language" => Self::ProgrammingLanguage,
            "framework" => Self::Framework,
            "database" => Self::Database,
            "file" => Self::File,
            "url" => Self::Url,
            "command" => Self::Command,
            "search_query" => Self::SearchQuery,
            "task" => Self::Task,
            "api_endpoint" => Self::ApiEndpoint,
            "error_message" => Self::ErrorMessage,
            "design_pattern" => Self::DesignPattern,
            "architecture_concept" => Self::ArchitectureConcept,
            _ => Self::Other,
        }
    }

    /// The snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Location => "location",
            Self::Product => "product",
            Self::Building => "building",
            Self::Group => "group",
            Self::CreativeWork => "creative_work",
            Self::Date => "date",
            Self::Time => "time",
            Self::Money => "money",
            Self::Percent => "percent",
            Self::ProgrammingLanguage => "programming_language",
            Self::Framework => "framework",
            Self::Database => "database",
            Self::File => "file",
            Self::Url => "url",
            Self::Command => "command",
            Self::SearchQuery => "search_query",
            Self::Task => "task",
            Self::ApiEndpoint => "api_endpoint",
            Self::ErrorMessage => "error_message",
            Self::DesignPattern => "design_pattern",
            Self::ArchitectureConcept => "architecture_concept",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for EntityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EntityLabel {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

/// Dedup key form of entity text: trimmed, whitespace collapsed, case-folded.
/// File paths also get forward slashes.
pub fn normalize_entity_text(text: &str, label: EntityLabel) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let folded = collapsed.to_lowercase();
    if label == EntityLabel::File {
        folded.replace('\\', "/")
    } else {
        folded
    }
}

// =============================================================================
// Entities
// =============================================================================

/// Directed, non-owning edge to another entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    /// Relation name, e.g. `mentioned_with`.
    pub relation: String,
    /// Target entity.
    pub target: EntityId,
}

/// A tracked, deduplicated entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable ID.
    pub id: EntityId,
    /// Dedup key text.
    pub normalized_text: String,
    /// First-seen surface form.
    pub display_text: String,
    /// Label.
    pub label: EntityLabel,
    /// Highest confidence seen, in `[0, 1]`.
    pub confidence: f64,
    /// Number of mentions.
    pub mention_count: u32,
    /// First mention.
    pub first_seen: DateTime<Utc>,
    /// Latest mention.
    pub last_seen: DateTime<Utc>,
    /// Outgoing edges.
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

// =============================================================================
// Messages
// =============================================================================

/// Who produced a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human.
    User,
    /// The agent.
    Agent,
    /// System-injected text.
    System,
    /// Compaction output replacing older messages.
    Summary,
}

impl Role {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
            Self::Summary => "summary",
        }
    }

    /// Parse a role name; `assistant` is accepted for `agent`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "user" => Some(Self::User),
            "agent" | "assistant" => Some(Self::Agent),
            "system" => Some(Self::System),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named agent view over the message log.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentScope(String);

impl AgentScope {
    /// A scope with the given name (trimmed, case-folded).
    pub fn new(name: &str) -> Result<Self> {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return Err(ContextError::InvalidScope("scope name is empty".into()));
        }
        Ok(Self(name))
    }

    /// The scope visible from every other scope.
    #[must_use]
    pub fn shared() -> Self {
        Self(SHARED_SCOPE.to_owned())
    }

    /// Whether this is the shared scope.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.0 == SHARED_SCOPE
    }

    /// Whether a message tagged `tag` is visible from this scope.
    #[must_use]
    pub fn sees(&self, tag: &AgentScope) -> bool {
        tag == self || tag.is_shared()
    }

    /// Scope name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentScope {
    fn default() -> Self {
        Self(DEFAULT_SCOPE.to_owned())
    }
}

impl fmt::Display for AgentScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One conversation entry. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable ID.
    pub id: MessageId,
    /// Author.
    pub role: Role,
    /// Text.
    pub content: String,
    /// Tokens counted at append time.
    pub token_cost: u64,
    /// Append time.
    pub timestamp: DateTime<Utc>,
    /// Entities mentioned (lookup only; may point at pruned entities in old snapshots).
    #[serde(default)]
    pub entity_refs: Vec<EntityId>,
    /// Scope the message was written in.
    pub agent_scope: AgentScope,
}

impl Message {
    /// Build a message with a fresh ID stamped now.
    pub fn new(
        role: Role,
        content: impl Into<String>,
        token_cost: u64,
        agent_scope: AgentScope,
        entity_refs: Vec<EntityId>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            token_cost,
            timestamp: Utc::now(),
            entity_refs,
            agent_scope,
        }
    }
}

// =============================================================================
// Manual context
// =============================================================================

/// Explicit, labeled context chunk supplied by the user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManualContextItem {
    /// Unique key.
    pub label: String,
    /// Where it came from (free text, e.g. `user` or a file path).
    pub source: String,
    /// Text.
    pub content: String,
    /// Tokens counted when last written.
    pub token_cost: u64,
    /// First add.
    pub created_at: DateTime<Utc>,
    /// Latest overwrite.
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Compaction history and diagnostics
// =============================================================================

/// One applied compaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompactionRecord {
    /// Summary message that replaced the window (absent for migrated records).
    #[serde(default)]
    pub summary_message_id: Option<MessageId>,
    /// Summary text.
    pub summary: String,
    /// Session total before the swap.
    pub tokens_before: u64,
    /// Session total after the swap.
    pub tokens_after: u64,
    /// Messages replaced.
    #[serde(default)]
    pub messages_replaced: usize,
    /// Entities pruned with the window.
    #[serde(default)]
    pub entities_pruned: usize,
    /// When it was applied.
    pub at: DateTime<Utc>,
}

/// Kind of non-fatal problem recorded on the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Extractor failed or timed out; pattern fallback used.
    ExtractionFallback,
    /// All summarization attempts failed.
    SummarizationFailed,
    /// Summary was not smaller than its window.
    SummaryRejected,
    /// A save call failed.
    PersistenceFailed,
}

/// A recorded warning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Kind.
    pub kind: DiagnosticKind,
    /// Human-readable detail.
    pub message: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl Diagnostic {
    /// Stamp a diagnostic now.
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

// =============================================================================
// Session state
// =============================================================================

/// Serializable form of a whole session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Session ID.
    pub session_id: SessionId,
    /// Messages, oldest first.
    pub messages: Vec<Message>,
    /// Entities by ID.
    pub entities: BTreeMap<EntityId, Entity>,
    /// Manual context in insertion order.
    pub manual_items: Vec<ManualContextItem>,
    /// Cached total of message and manual-item costs.
    pub token_count: u64,
    /// Budget ceiling.
    pub max_tokens: u64,
    /// Fraction of `max_tokens` that triggers compaction.
    pub summarization_ratio: f64,
    /// Active scope.
    pub agent_scope: AgentScope,
    /// Applied compactions, oldest first.
    #[serde(default)]
    pub compactions: Vec<CompactionRecord>,
    /// Recent warnings, oldest first.
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    /// Caller-owned key/value state, kept across saves.
    #[serde(default)]
    pub state: BTreeMap<String, serde_json::Value>,
}
