//! Entity extraction.
//!
//! [`EntityExtractor`] is the seam for an NLP model. [`PatternExtractor`] is
//! the deterministic regex fallback used when the model fails or times out,
//! and the default extractor when none is configured.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::types::{EntityLabel, normalize_entity_text};

/// One entity found in a piece of text.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedEntity {
    /// Surface text.
    pub text: String,
    /// Label as reported by the extractor; parsed with [`EntityLabel::parse`].
    pub label: String,
    /// Extractor confidence.
    pub confidence: f64,
}

impl ExtractedEntity {
    /// Convenience constructor.
    pub fn new(text: impl Into<String>, label: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            label: label.into(),
            confidence,
        }
    }
}

/// Finds entities in text.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    /// Extract entities from `text`.
    async fn extract(
        &self,
        text: &str,
    ) -> Result<Vec<ExtractedEntity>, Box<dyn std::error::Error + Send + Sync>>;
}

// =============================================================================
// Pattern fallback
// =============================================================================

const FILE_CONFIDENCE: f64 = 0.7;
const URL_CONFIDENCE: f64 = 0.85;
const COMMAND_CONFIDENCE: f64 = 0.9;
const SEARCH_CONFIDENCE: f64 = 0.8;
const TASK_CONFIDENCE: f64 = 0.8;
const LANGUAGE_CONFIDENCE: f64 = 0.85;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s]+").expect("url pattern compiles"));

static FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"[\w/.\\-]+\.(?:py|js|ts|tsx|jsx|html|css|java|cpp|h|c|rb|go|rs|php|md|json|yaml|yml|toml|xml)\b",
    )
    .expect("file pattern compiles")
});

static SEARCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:search|find|look for)\s+(.+?)(?:[?.]|$)").expect("search pattern compiles")
});

static TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:implement|create|fix|debug|optimize|refactor|add|build|develop)\s+[^.\n?!]+")
        .expect("task pattern compiles")
});

static LANGUAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:Python|JavaScript|TypeScript|Java|Go|Rust)\b|\bC\+\+")
        .expect("language pattern compiles")
});

/// Deterministic regex extractor for files, URLs, commands, searches,
/// tasks, and programming languages.
#[derive(Clone, Copy, Debug, Default)]
pub struct PatternExtractor;

impl PatternExtractor {
    /// Extract synchronously. Results are deduplicated by normalized text and label.
    pub fn extract_sync(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut out = Collector::default();

        let trimmed = text.trim_start();
        if let Some(rest) = trimmed.strip_prefix('!').or_else(|| trimmed.strip_prefix('$')) {
            let command = rest.lines().next().unwrap_or_default().trim();
            out.push(command, EntityLabel::Command, COMMAND_CONFIDENCE);
        }

        if let Some(caps) = SEARCH_RE.captures(trimmed) {
            if let Some(q) = caps.get(1) {
                out.push(q.as_str().trim(), EntityLabel::SearchQuery, SEARCH_CONFIDENCE);
            }
        }

        let mut url_spans: Vec<Range<usize>> = Vec::new();
        for m in URL_RE.find_iter(text) {
            let url = m.as_str().trim_end_matches(['.', ',', ')', ';', ':', '!', '?', '"', '\'']);
            url_spans.push(m.range());
            out.push(url, EntityLabel::Url, URL_CONFIDENCE);
        }

        for m in FILE_RE.find_iter(text) {
            let inside_url = url_spans
                .iter()
                .any(|span| span.start <= m.start() && m.end() <= span.end);
            if !inside_url {
                out.push(m.as_str(), EntityLabel::File, FILE_CONFIDENCE);
            }
        }

        for m in TASK_RE.find_iter(text) {
            out.push(m.as_str().trim(), EntityLabel::Task, TASK_CONFIDENCE);
        }

        for m in LANGUAGE_RE.find_iter(text) {
            out.push(m.as_str(), EntityLabel::ProgrammingLanguage, LANGUAGE_CONFIDENCE);
        }

        out.found
    }
}

#[async_trait]
impl EntityExtractor for PatternExtractor {
    async fn extract(
        &self,
        text: &str,
    ) -> Result<Vec<ExtractedEntity>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.extract_sync(text))
    }
}

#[derive(Default)]
struct Collector {
    seen: HashSet<(String, EntityLabel)>,
    found: Vec<ExtractedEntity>,
}

impl Collector {
    fn push(&mut self, text: &str, label: EntityLabel, confidence: f64) {
        if text.is_empty() {
            return;
        }
        if self.seen.insert((normalize_entity_text(text, label), label)) {
            self.found
                .push(ExtractedEntity::new(text, label.as_str(), confidence));
        }
    }
}
