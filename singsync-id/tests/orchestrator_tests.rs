//! Orchestrator integration tests
//!
//! Fan-out, completion ordering, deadline handling and cancellation, driven by mock
//! engines on a paused clock.

mod helpers;

use helpers::{entry, entry_with_timeout, sample, song};
use singsync_common::{ErrorKind, RunEvent};
use singsync_id::engines::mock::{MockBehavior, MockEngine};
use singsync_id::orchestrator::{Orchestrator, RunOutcome, RunRequest, MAX_GLOBAL_TIMEOUT};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn request(engines: Vec<singsync_id::engines::RegisteredEngine>, timeout_secs: u64) -> RunRequest {
    RunRequest {
        sample: sample(),
        engines,
        global_timeout: Some(Duration::from_secs(timeout_secs)),
    }
}

/// Let aborted and cancelled engine tasks wind down
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn drain(rx: &mut mpsc::UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_one_card_per_engine_regardless_of_outcome() {
    // Given: one success, one failure, one panic
    let engines = vec![
        entry(MockEngine::new("ok").returning(vec![song("Song", "Artist", 0.8)])),
        entry(MockEngine::new("fails").failing(ErrorKind::UpstreamError)),
        entry(MockEngine::new("panics").with_behavior(MockBehavior::Panic)),
    ];

    // When: the run completes
    let summary = Orchestrator::default()
        .run(request(engines, 10), None, CancellationToken::new())
        .await;

    // Then: three cards, each engine exactly once
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.cards.len(), 3);
    let mut sources: Vec<&str> = summary.cards.iter().map(|c| c.source.as_str()).collect();
    sources.sort();
    assert_eq!(sources, vec!["fails", "ok", "panics"]);

    let panicked = summary.cards.iter().find(|c| c.source == "panics").unwrap();
    assert!(!panicked.ok);
    assert_eq!(panicked.error_kind(), Some(ErrorKind::InternalError));
}

#[tokio::test(start_paused = true)]
async fn test_events_follow_completion_order_then_done() {
    let engines = vec![
        entry(MockEngine::new("c").with_delay(Duration::from_secs(3))),
        entry(MockEngine::new("a").with_delay(Duration::from_secs(1))),
        entry(MockEngine::new("b").with_delay(Duration::from_secs(2))),
    ];
    let (tx, mut rx) = mpsc::unbounded_channel();

    let summary = Orchestrator::default()
        .run(request(engines, 10), Some(tx), CancellationToken::new())
        .await;
    let events = drain(&mut rx);

    let card_sources: Vec<&str> = events
        .iter()
        .filter_map(|e| e.as_card())
        .map(|c| c.source.as_str())
        .collect();
    assert_eq!(card_sources, vec!["a", "b", "c"]);
    assert!(matches!(events.last(), Some(RunEvent::Done { cards: 3, .. })));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(summary.cards.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_synthesizes_exactly_one_timeout_card() {
    // Given: three engines, one far beyond the 5s deadline
    let stuck = MockEngine::new("stuck").with_delay(Duration::from_secs(120));
    let probe = stuck.probe();
    let engines = vec![
        entry(MockEngine::new("a").with_delay(Duration::from_secs(1))),
        entry(stuck),
        entry(MockEngine::new("b").with_delay(Duration::from_secs(2))),
    ];
    let (tx, mut rx) = mpsc::unbounded_channel();
    let started = Instant::now();

    // When: the run hits its deadline
    let summary = Orchestrator::default()
        .run(request(engines, 5), Some(tx), CancellationToken::new())
        .await;

    // Then: 3 cards, exactly one timeout, for the stuck engine
    assert_eq!(summary.outcome, RunOutcome::TimedOut);
    assert_eq!(summary.cards.len(), 3);
    let timeouts: Vec<&str> = summary.timed_out().collect();
    assert_eq!(timeouts, vec!["stuck"]);
    assert_eq!(summary.cards.last().unwrap().source, "stuck");

    // And: the run ended at the deadline, and no card reports more than the deadline
    assert!(started.elapsed() <= Duration::from_secs(5) + Duration::from_millis(50));
    assert!(summary.cards.iter().all(|c| c.elapsed_seconds <= 5.0));

    // And: the stuck engine was told to stop
    settle().await;
    assert_eq!(probe.started(), 1);
    assert_eq!(probe.finished(), 0);

    let events = drain(&mut rx);
    match events.last() {
        Some(RunEvent::Timeout { cards, timed_out, .. }) => {
            assert_eq!(*cards, 3);
            assert_eq!(timed_out, &vec!["stuck".to_string()]);
        }
        other => panic!("expected timeout marker, got {:?}", other),
    }
    assert_eq!(events.len(), 4, "three cards plus the marker");
}

#[tokio::test(start_paused = true)]
async fn test_engine_ignoring_cancel_is_still_cut_off() {
    let stubborn = MockEngine::new("stubborn")
        .with_delay(Duration::from_secs(60))
        .ignoring_cancel();
    let probe = stubborn.probe();
    let started = Instant::now();

    let summary = Orchestrator::default()
        .run(request(vec![entry(stubborn)], 2), None, CancellationToken::new())
        .await;

    assert_eq!(summary.outcome, RunOutcome::TimedOut);
    assert!(started.elapsed() <= Duration::from_secs(2) + Duration::from_millis(50));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(probe.finished(), 0, "aborted task never completes");
}

#[tokio::test(start_paused = true)]
async fn test_engine_timeout_override_yields_timeout_card() {
    // Given: an engine with a 1s cut-off inside a 10s run
    let engines = vec![
        entry_with_timeout(
            MockEngine::new("short").with_delay(Duration::from_secs(5)),
            Duration::from_secs(1),
        ),
        entry(MockEngine::new("normal").with_delay(Duration::from_secs(3))),
    ];

    let summary = Orchestrator::default()
        .run(request(engines, 10), None, CancellationToken::new())
        .await;

    // Then: the run completes normally; the short engine reports its own timeout first
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.cards[0].source, "short");
    assert_eq!(summary.cards[0].error_kind(), Some(ErrorKind::Timeout));
    assert!((summary.cards[0].elapsed_seconds - 1.0).abs() < 1e-6);
    assert!(summary.cards[1].ok);
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancel_stops_run_without_marker() {
    let slow = MockEngine::new("slow").with_delay(Duration::from_secs(30));
    let probe = slow.probe();
    let engines = vec![
        entry(MockEngine::new("fast").with_delay(Duration::from_secs(1))),
        entry(slow),
    ];
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        canceller.cancel();
    });

    let summary = Orchestrator::default()
        .run(request(engines, 10), Some(tx), cancel)
        .await;

    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.cards.len(), 1);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(events.iter().all(|e| !e.is_terminal()));

    settle().await;
    assert_eq!(probe.interrupted(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_receiver_cancels_run() {
    let slow = MockEngine::new("slow").with_delay(Duration::from_secs(30));
    let probe = slow.probe();
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);

    let summary = Orchestrator::default()
        .run(request(vec![entry(slow)], 10), Some(tx), CancellationToken::new())
        .await;

    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert!(summary.cards.is_empty());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(probe.finished(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_huge_timeouts_are_clamped() {
    // Given: a global timeout and an engine override far beyond any Instant range
    let engines = vec![
        entry_with_timeout(
            MockEngine::new("a").with_delay(Duration::from_secs(1)),
            Duration::from_secs(u64::MAX / 2),
        ),
        entry(MockEngine::new("b").with_delay(Duration::from_secs(2))),
    ];
    let mut req = request(engines, 10);
    req.global_timeout = Some(Duration::from_secs(u64::MAX / 2));

    // When
    let summary = Orchestrator::default()
        .run(req, None, CancellationToken::new())
        .await;

    // Then: the run completes normally
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.cards.len(), 2);
    assert!(summary.cards.iter().all(|c| c.ok));
}

#[tokio::test(start_paused = true)]
async fn test_stuck_engine_cut_off_at_max_timeout() {
    let stuck = MockEngine::new("stuck").with_delay(Duration::from_secs(u64::MAX / 4));
    let started = Instant::now();

    let summary = Orchestrator::new(Duration::from_secs(u64::MAX / 2))
        .run(
            RunRequest {
                sample: sample(),
                engines: vec![entry(stuck)],
                global_timeout: None,
            },
            None,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(summary.outcome, RunOutcome::TimedOut);
    assert!(started.elapsed() <= MAX_GLOBAL_TIMEOUT + Duration::from_millis(50));
}
