//! Session facade behaviour: budget scenarios, manual context, entities, scopes, retrieval.

#![allow(missing_docs)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use mnemo_context::{
    CompactionOutcome, ContextError, DiagnosticKind, EntityLabel, RelevantSource, Role, Session,
    SessionConfig, SessionPhase,
};

use common::{FailingExtractor, SlowExtractor, config, deps, filler, session};

// ── Budget scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn threshold_crossing_collapses_old_messages_into_one_summary() {
    let s = session(config(1_000, 0.8, 10), "summary of earlier turns");

    for i in 0..16 {
        let appended = s.add_user_message(&filler(50)).await.unwrap();
        assert_eq!(appended.token_cost, 50);
        assert!(appended.compaction.is_none(), "message {i} compacted early");
    }
    assert_eq!(s.token_count().await, 800);

    let appended = s.add_user_message(&filler(50)).await.unwrap();
    let Some(CompactionOutcome::Compacted(record)) = appended.compaction else {
        panic!("expected a compaction, got {:?}", appended.compaction);
    };
    assert_eq!(record.tokens_before, 850);
    assert_eq!(record.messages_replaced, 7);
    assert_eq!(record.tokens_after, 10 * 50 + 4);

    let messages = s.messages().await;
    assert_eq!(messages.len(), 11);
    assert_eq!(messages[0].role, Role::Summary);
    assert_eq!(messages[0].content, "summary of earlier turns");
    assert!(messages[1..].iter().all(|m| m.role == Role::User));
    assert!(s.token_count().await < 800);
    s.verify_accounting().await.unwrap();
}

#[tokio::test]
async fn manual_context_is_listed_with_its_cost_and_released_on_removal() {
    let s = session(config(1_000, 0.8, 10), "s");
    let _ = s.add_user_message("hello there").await.unwrap();
    let before = s.token_count().await;

    let set = s
        .add_manual_context("notes", "user", "Remember: use async IO")
        .await
        .unwrap();
    assert_eq!(set.token_cost, 4);
    assert!(!set.replaced);
    assert!(set.compaction.is_none());
    assert_eq!(s.token_count().await, before + 4);

    let summary = s.get_context_summary().await;
    assert_eq!(summary.manual_items.len(), 1);
    assert_eq!(summary.manual_items[0].label, "notes");
    assert_eq!(summary.manual_items[0].token_cost, 4);
    assert!(summary.to_string().contains("notes (user): 4 tokens"));

    assert!(s.remove_manual_context("notes").await.unwrap());
    assert_eq!(s.token_count().await, before);
    assert!(!s.remove_manual_context("missing").await.unwrap());
    s.verify_accounting().await.unwrap();
}

#[tokio::test]
async fn manual_labels_are_unique() {
    let s = session(config(1_000, 0.8, 10), "s");
    let _ = s.add_manual_context("notes", "user", "one two three").await.unwrap();
    let set = s.add_manual_context("notes", "file.md", "one").await.unwrap();
    assert!(set.replaced);

    let summary = s.get_context_summary().await;
    assert_eq!(summary.manual_items.len(), 1);
    assert_eq!(summary.manual_items[0].source, "file.md");
    assert_eq!(s.token_count().await, 1);
    s.verify_accounting().await.unwrap();

    assert_matches!(
        s.add_manual_context("  ", "user", "text").await,
        Err(ContextError::InvalidManualContext(_))
    );
}

#[tokio::test]
async fn manual_context_over_the_threshold_compacts_the_log() {
    let s = session(config(1_000, 0.8, 2), "recap");
    for _ in 0..5 {
        let appended = s.add_user_message(&filler(100)).await.unwrap();
        assert!(appended.compaction.is_none());
    }

    let set = s.add_manual_context("spec", "file", &filler(400)).await.unwrap();
    let Some(CompactionOutcome::Compacted(record)) = set.compaction else {
        panic!("expected a compaction, got {:?}", set.compaction);
    };
    assert_eq!(record.tokens_before, 900);
    assert_eq!(record.messages_replaced, 3);
    assert_eq!(record.tokens_after, 900 - 300 + 1);
    assert!(s.token_count().await <= 800);
    assert_eq!(s.get_context_summary().await.manual_items.len(), 1);
    s.verify_accounting().await.unwrap();
}

// ── Entities ────────────────────────────────────────────────────────────

#[tokio::test]
async fn re_adding_an_entity_merges() {
    let s = session(config(1_000, 0.8, 10), "s");
    let first = s.add_entity("OpenAI", "ORG", 0.9).await.unwrap();
    let second = s.add_entity("openai", "organization", 0.5).await.unwrap();
    assert_eq!(first, second);

    let orgs = s.get_entities(Some("org")).await;
    assert_eq!(orgs.len(), 1);
    assert_eq!(orgs[0].mention_count, 2);
    assert!((orgs[0].confidence - 0.9).abs() < f64::EPSILON);
    assert_eq!(orgs[0].label, EntityLabel::Organization);
}

#[tokio::test]
async fn commands_and_files_are_tracked_by_type() {
    let s = session(config(1_000, 0.8, 10), "s");
    let _ = s.add_user_message("!cargo fmt --check").await.unwrap();
    let _ = s.add_agent_message("updated src/session.rs").await.unwrap();

    let commands = s.get_entities(Some("command")).await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].display_text, "cargo fmt --check");

    let files = s.get_entities(Some("file")).await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].display_text, "src/session.rs");

    let summary = s.get_context_summary().await.to_string();
    assert!(summary.contains("Recent files: src/session.rs"));
    assert!(summary.contains("Recent commands: cargo fmt --check"));
}

#[tokio::test]
async fn relationship_cycles_are_walked_once() {
    let s = session(config(1_000, 0.8, 10), "s");
    let a = s.add_entity("a", "other", 1.0).await.unwrap();
    let b = s.add_entity("b", "other", 1.0).await.unwrap();
    let c = s.add_entity("c", "other", 1.0).await.unwrap();
    assert!(s.relate_entities(&a, "depends_on", &b).await.unwrap());
    assert!(s.relate_entities(&b, "depends_on", &c).await.unwrap());
    assert!(s.relate_entities(&c, "depends_on", &a).await.unwrap());
    assert!(!s.relate_entities(&a, "depends_on", &b).await.unwrap());

    let related = s.find_related(&a, 10).await.unwrap();
    let names: Vec<_> = related.iter().map(|e| e.display_text.as_str()).collect();
    assert_eq!(names, vec!["b", "c"]);

    assert_eq!(s.find_related(&a, 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn extractor_error_engages_the_fallback() {
    let deps = deps(Arc::new(common::FixedSummarizer::new("s")))
        .with_extractor(Arc::new(FailingExtractor));
    let s = Session::new(config(1_000, 0.8, 10), deps);

    let appended = s
        .add_user_message("see https://docs.rs/tokio for details")
        .await
        .unwrap();
    assert_eq!(appended.entity_refs.len(), 1);
    assert_eq!(s.get_entities(Some("url")).await.len(), 1);

    let diagnostics = s.diagnostics().await;
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].kind, DiagnosticKind::ExtractionFallback);
}

#[tokio::test(start_paused = true)]
async fn extractor_timeout_engages_the_fallback() {
    let config = SessionConfig {
        extraction_timeout: Duration::from_millis(100),
        ..config(1_000, 0.8, 10)
    };
    let deps = deps(Arc::new(common::FixedSummarizer::new("s")))
        .with_extractor(Arc::new(SlowExtractor));
    let s = Session::new(config, deps);

    let ids = s.track_entities("written in Rust").await.unwrap();
    assert_eq!(ids.len(), 1);
    let diagnostics = s.diagnostics().await;
    assert!(diagnostics[0].message.contains("timed out after 100ms"));
}

// ── Scopes and views ────────────────────────────────────────────────────

#[tokio::test]
async fn scopes_filter_messages_but_share_entities_and_manual_context() {
    let s = session(config(1_000, 0.8, 10), "s");
    let _ = s.add_user_message("planning in main.rs").await.unwrap();
    let _ = s.add_manual_context("notes", "user", "shared note").await.unwrap();

    let scope = s.switch_agent_scope("  Coder ").await.unwrap();
    assert_eq!(scope.as_str(), "coder");
    let _ = s.add_agent_message("coding now").await.unwrap();

    let visible: Vec<_> = s.messages().await.into_iter().map(|m| m.content).collect();
    assert_eq!(visible, vec!["coding now".to_owned()]);
    assert_eq!(s.get_entities(Some("file")).await.len(), 1);
    assert_eq!(s.get_context_summary().await.manual_items.len(), 1);

    let _ = s.switch_agent_scope("default").await.unwrap();
    let visible: Vec<_> = s.messages().await.into_iter().map(|m| m.content).collect();
    assert_eq!(visible, vec!["planning in main.rs".to_owned()]);

    assert_matches!(
        s.switch_agent_scope("").await,
        Err(ContextError::InvalidScope(_))
    );
}

#[tokio::test]
async fn window_and_range_views() {
    let s = session(config(1_000, 0.8, 10), "s");
    let mut ids = Vec::new();
    for word in ["one", "two", "three", "four"] {
        ids.push(s.add_user_message(word).await.unwrap().id);
    }

    let window: Vec<_> = s.get_window(2).await.into_iter().map(|m| m.content).collect();
    assert_eq!(window, vec!["three", "four"]);
    assert_eq!(s.get_window(10).await.len(), 4);

    let range: Vec<_> = s
        .get_range(&ids[1], &ids[2])
        .await
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(range, vec!["two", "three"]);
    assert!(s.get_range(&ids[2], &ids[1]).await.is_empty());
}

#[tokio::test]
async fn system_role_and_summary_role() {
    let s = session(config(1_000, 0.8, 10), "s");
    assert_eq!(s.phase().await, SessionPhase::Initialized);
    let _ = s.add_message(Role::System, "be concise").await.unwrap();
    assert_eq!(s.phase().await, SessionPhase::Active);
    assert_matches!(
        s.add_message(Role::Summary, "forged").await,
        Err(ContextError::InvalidMessage(_))
    );
    assert_eq!(s.messages().await.len(), 1);
}

// ── Relevant context ────────────────────────────────────────────────────

#[tokio::test]
async fn relevant_context_prefers_matching_messages() {
    let s = session(config(1_000, 0.8, 10), "s");
    let _ = s.add_user_message("the retry backoff uses jitter").await.unwrap();
    let _ = s.add_user_message("lunch plans for friday").await.unwrap();

    let items = s.get_relevant_context("retry backoff", 1).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].text, "the retry backoff uses jitter");
    assert_matches!(items[0].source, RelevantSource::Message { role: Role::User, .. });
}

#[tokio::test]
async fn relevant_context_respects_the_token_budget() {
    let config = SessionConfig {
        relevant_context_tokens: 4,
        ..config(1_000, 0.8, 10)
    };
    let s = session(config, "s");
    let _ = s.add_user_message("the retry backoff uses jitter").await.unwrap();
    let _ = s.add_user_message("lunch plans for friday").await.unwrap();

    let items = s.get_relevant_context("retry backoff", 10).await;
    let total: u64 = items.iter().map(|i| i.token_cost).sum();
    assert!(total <= 4);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].text, "lunch plans for friday");
}
