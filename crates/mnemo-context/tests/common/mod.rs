//! Shared test doubles for the session integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mnemo_context::{
    Entity, EntityExtractor, ExtractedEntity, MemorySnapshotStore, Message, Session,
    SessionConfig, SessionDeps, SnapshotStore, Summarizer, Tokenizer,
};
use mnemo_core::retry::RetryConfig;
use tokio::sync::Notify;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One token per whitespace-separated word.
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn count_tokens(&self, text: &str) -> u64 {
        text.split_whitespace().count() as u64
    }
}

/// `n` filler words that no extractor pattern matches.
pub fn filler(n: usize) -> String {
    (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
}

/// Always returns the same summary.
pub struct FixedSummarizer(pub String);

impl FixedSummarizer {
    pub fn new(text: &str) -> Self {
        Self(text.to_owned())
    }
}

#[async_trait]
impl Summarizer for FixedSummarizer {
    async fn summarize(&self, _: &[Message], _: &[Entity]) -> Result<String, BoxError> {
        Ok(self.0.clone())
    }
}

/// Always fails, counting calls.
#[derive(Default)]
pub struct FailingSummarizer {
    pub calls: AtomicU32,
}

#[async_trait]
impl Summarizer for FailingSummarizer {
    async fn summarize(&self, _: &[Message], _: &[Entity]) -> Result<String, BoxError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Err(format!("model overloaded ({n})").into())
    }
}

/// Never answers.
pub struct StalledSummarizer;

#[async_trait]
impl Summarizer for StalledSummarizer {
    async fn summarize(&self, _: &[Message], _: &[Entity]) -> Result<String, BoxError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok("too late".into())
    }
}

/// Signals `entered` when called, then waits for `release` before answering.
pub struct GatedSummarizer {
    pub entered: Notify,
    pub release: Notify,
    pub text: String,
}

impl GatedSummarizer {
    pub fn new(text: &str) -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            release: Notify::new(),
            text: text.to_owned(),
        })
    }
}

#[async_trait]
impl Summarizer for GatedSummarizer {
    async fn summarize(&self, _: &[Message], _: &[Entity]) -> Result<String, BoxError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(self.text.clone())
    }
}

/// Extractor that always errors.
pub struct FailingExtractor;

#[async_trait]
impl EntityExtractor for FailingExtractor {
    async fn extract(&self, _: &str) -> Result<Vec<ExtractedEntity>, BoxError> {
        Err("ner model missing".into())
    }
}

/// Extractor that never answers.
pub struct SlowExtractor;

#[async_trait]
impl EntityExtractor for SlowExtractor {
    async fn extract(&self, _: &str) -> Result<Vec<ExtractedEntity>, BoxError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(Vec::new())
    }
}

/// Zero-jitter retry so backoff timings are exact.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        jitter_factor: 0.0,
    }
}

pub fn config(max_tokens: u64, ratio: f64, preserve_recent: usize) -> SessionConfig {
    SessionConfig {
        max_tokens,
        summarization_ratio: ratio,
        preserve_recent,
        retry: fast_retry(),
        ..SessionConfig::default()
    }
}

pub fn deps(summarizer: Arc<dyn Summarizer>) -> SessionDeps {
    deps_with_store(summarizer, Arc::new(MemorySnapshotStore::new()))
}

pub fn deps_with_store(
    summarizer: Arc<dyn Summarizer>,
    store: Arc<dyn SnapshotStore>,
) -> SessionDeps {
    SessionDeps::new(summarizer, store).with_tokenizer(Arc::new(WordTokenizer))
}

/// Session with the word tokenizer, a fixed summary, and an in-memory store.
pub fn session(config: SessionConfig, summary: &str) -> Session {
    Session::new(config, deps(Arc::new(FixedSummarizer::new(summary))))
}
