//! Compaction: retry exhaustion, rejected summaries, concurrent appends,
//! background mode, and reload invalidation.

#![allow(missing_docs)]

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use assert_matches::assert_matches;
use mnemo_context::{
    CompactionOutcome, CompactionPhase, ContextError, DiagnosticKind, Role, Session,
    SessionConfig, SessionPhase, SkipReason,
};
use mnemo_settings::CompactionMode;

use common::{
    FailingSummarizer, GatedSummarizer, StalledSummarizer, config, deps, filler, session,
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_the_window_untouched() {
    let summarizer = Arc::new(FailingSummarizer::default());
    let s = Session::new(config(1_000, 0.8, 2), deps(summarizer.clone()));
    for _ in 0..5 {
        let _ = s.add_user_message(&filler(10)).await.unwrap();
    }
    let before = s.messages().await;
    let tokens_before = s.token_count().await;

    let started = tokio::time::Instant::now();
    let err = s.compact_now().await.unwrap_err();
    assert_matches!(err, ContextError::SummarizationFailure { attempts: 3, .. });
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(300));

    assert_eq!(s.messages().await, before);
    assert_eq!(s.token_count().await, tokens_before);
    assert_eq!(s.compaction_phase().await, CompactionPhase::Idle);
    let diagnostics = s.diagnostics().await;
    assert_eq!(diagnostics.last().unwrap().kind, DiagnosticKind::SummarizationFailed);
}

#[tokio::test(start_paused = true)]
async fn threshold_failure_is_reported_but_the_append_succeeds() {
    let s = Session::new(
        config(100, 0.5, 2),
        deps(Arc::new(FailingSummarizer::default())),
    );
    for _ in 0..5 {
        let appended = s.add_user_message(&filler(10)).await.unwrap();
        assert!(appended.compaction.is_none());
    }
    let appended = s.add_user_message(&filler(10)).await.unwrap();
    assert_matches!(
        appended.compaction,
        Some(CompactionOutcome::Failed { attempts: 3, .. })
    );
    assert_eq!(s.messages().await.len(), 6);
    assert_eq!(s.token_count().await, 60);
    s.verify_accounting().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stalled_summarizer_times_out_per_attempt() {
    let config = SessionConfig {
        summary_timeout: Duration::from_millis(500),
        ..config(1_000, 0.8, 1)
    };
    let s = Session::new(config, deps(Arc::new(StalledSummarizer)));
    let _ = s.add_user_message("first message").await.unwrap();
    let _ = s.add_user_message("second message").await.unwrap();
    let _ = s.add_user_message("third message").await.unwrap();

    let err = s.compact_now().await.unwrap_err();
    assert_matches!(
        err,
        ContextError::SummarizationFailure { attempts: 3, ref message } if message.contains("timed out")
    );
    assert_eq!(s.messages().await.len(), 3);
}

#[tokio::test]
async fn summary_that_is_not_smaller_is_discarded() {
    let s = session(config(1_000, 0.8, 1), &filler(40));
    let _ = s.add_user_message(&filler(5)).await.unwrap();
    let _ = s.add_user_message(&filler(5)).await.unwrap();
    let _ = s.add_user_message(&filler(5)).await.unwrap();
    let before = s.messages().await;

    let outcome = s.compact_now().await.unwrap();
    assert_eq!(outcome, CompactionOutcome::Skipped(SkipReason::NotSmaller));
    assert_eq!(s.messages().await, before);
    assert_eq!(s.token_count().await, 15);
    assert_eq!(
        s.diagnostics().await.last().unwrap().kind,
        DiagnosticKind::SummaryRejected
    );
}

#[tokio::test]
async fn appends_during_summarization_survive_the_swap() {
    let gate = GatedSummarizer::new("short summary");
    let s = Session::new(config(1_000, 0.8, 1), deps(gate.clone()));
    for _ in 0..4 {
        let _ = s.add_user_message(&filler(10)).await.unwrap();
    }

    let worker = s.clone();
    let handle = tokio::spawn(async move { worker.compact_now().await });
    gate.entered.notified().await;

    assert_eq!(s.compaction_phase().await, CompactionPhase::Summarizing);
    let late = tokio::time::timeout(WAIT, s.add_agent_message("late arrival"))
        .await
        .expect("append blocked by an in-flight summarization")
        .unwrap();
    assert_eq!(
        s.compact_now().await.unwrap(),
        CompactionOutcome::Skipped(SkipReason::InFlight)
    );

    gate.release.notify_one();
    let outcome = handle.await.unwrap().unwrap();
    let CompactionOutcome::Compacted(record) = outcome else {
        panic!("expected compaction, got {outcome:?}");
    };
    assert_eq!(record.messages_replaced, 3);

    let messages = s.messages().await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].role, Role::Summary);
    assert_eq!(messages[2].id, late.id);
    assert_eq!(s.token_count().await, 2 + 10 + 2);
    s.verify_accounting().await.unwrap();
}

#[tokio::test]
async fn reload_during_summarization_discards_the_summary() {
    let gate = GatedSummarizer::new("short summary");
    let s = Session::new(config(1_000, 0.8, 1), deps(gate.clone()));
    for _ in 0..3 {
        let _ = s.add_user_message(&filler(10)).await.unwrap();
    }
    let saved = s.snapshot().await;

    let worker = s.clone();
    let handle = tokio::spawn(async move { worker.compact_now().await });
    gate.entered.notified().await;

    s.restore(saved.clone()).await.unwrap();
    gate.release.notify_one();
    assert_eq!(
        handle.await.unwrap().unwrap(),
        CompactionOutcome::Skipped(SkipReason::Invalidated)
    );
    assert_eq!(s.snapshot().await, saved);
    assert_eq!(s.compaction_phase().await, CompactionPhase::Idle);
}

#[tokio::test]
async fn background_mode_schedules_and_applies() {
    let config = SessionConfig {
        mode: CompactionMode::Background,
        ..config(100, 0.5, 2)
    };
    let s = session(config, "bg summary");
    for _ in 0..5 {
        let _ = s.add_user_message(&filler(10)).await.unwrap();
    }
    let appended = s.add_user_message(&filler(10)).await.unwrap();
    assert_eq!(appended.compaction, Some(CompactionOutcome::Scheduled));

    tokio::time::timeout(WAIT, s.wait_idle())
        .await
        .expect("background compaction never finished");

    assert_eq!(s.compactions().await.len(), 1);
    assert_eq!(s.messages().await.len(), 3);
    assert_eq!(s.token_count().await, 2 + 20);
    s.verify_accounting().await.unwrap();
}

#[tokio::test]
async fn single_scope_summary_stays_in_that_scope() {
    let s = session(config(1_000, 0.8, 1), "recap");
    let _ = s.switch_agent_scope("planner").await.unwrap();
    let _ = s.add_user_message("alpha step").await.unwrap();
    let _ = s.add_user_message("beta step").await.unwrap();
    let _ = s.add_user_message("gamma step").await.unwrap();
    assert!(s.compact_now().await.unwrap().is_compacted());

    let visible = s.messages().await;
    assert_eq!(visible.len(), 2);
    assert_eq!(visible[0].content, "recap");
    assert_eq!(visible[0].agent_scope.as_str(), "planner");

    let _ = s.switch_agent_scope("reviewer").await.unwrap();
    assert!(s.messages().await.is_empty());
}

#[tokio::test]
async fn mixed_scope_summary_is_shared() {
    let s = session(config(1_000, 0.8, 1), "recap");
    let _ = s.switch_agent_scope("planner").await.unwrap();
    let _ = s.add_user_message("alpha step").await.unwrap();
    let _ = s.switch_agent_scope("coder").await.unwrap();
    let _ = s.add_user_message("beta step").await.unwrap();
    let _ = s.add_user_message("gamma step").await.unwrap();
    assert!(s.compact_now().await.unwrap().is_compacted());

    let _ = s.switch_agent_scope("reviewer").await.unwrap();
    let visible = s.messages().await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].content, "recap");
    assert!(visible[0].agent_scope.is_shared());
}

#[tokio::test]
async fn appends_up_to_the_threshold_never_compact() {
    let s = session(config(10, 0.8, 1), "recap");
    for _ in 0..4 {
        let appended = s.add_user_message(&filler(2)).await.unwrap();
        assert!(appended.compaction.is_none());
    }
    let summary = s.get_context_summary().await;
    assert_eq!(summary.token_count, 8);
    assert_eq!(summary.compaction_count, 0);
    assert_eq!(summary.compaction_phase, CompactionPhase::Idle);
    assert_eq!(s.messages().await.len(), 4);

    let appended = s.add_user_message(&filler(1)).await.unwrap();
    assert_matches!(appended.compaction, Some(CompactionOutcome::Compacted(_)));
    assert_eq!(s.token_count().await, 1 + 1);
}

#[tokio::test]
async fn cancelled_compaction_releases_the_coordinator() {
    let gate = GatedSummarizer::new("short summary");
    let s = Session::new(config(1_000, 0.8, 1), deps(gate.clone()));
    for _ in 0..3 {
        let _ = s.add_user_message(&filler(10)).await.unwrap();
    }
    let before = s.messages().await;

    let worker = s.clone();
    let cancelled = tokio::spawn(async move { worker.compact_now().await });
    gate.entered.notified().await;
    assert_eq!(s.phase().await, SessionPhase::Summarizing);

    cancelled.abort();
    assert!(cancelled.await.unwrap_err().is_cancelled());
    assert_eq!(s.compaction_phase().await, CompactionPhase::Idle);
    assert_eq!(s.phase().await, SessionPhase::Active);
    assert_eq!(s.messages().await, before);
    assert!(s.compactions().await.is_empty());

    let worker = s.clone();
    let retried = tokio::spawn(async move { worker.compact_now().await });
    gate.entered.notified().await;
    gate.release.notify_one();
    let outcome = tokio::time::timeout(WAIT, retried)
        .await
        .expect("second compaction never finished")
        .unwrap()
        .unwrap();
    assert!(outcome.is_compacted(), "{outcome:?}");
    assert_eq!(s.compactions().await.len(), 1);
}
