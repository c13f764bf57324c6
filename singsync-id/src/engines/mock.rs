//! Mock recognition engine
//!
//! Scripted engine for tests and local development. Behavior is fixed at construction:
//! wait `delay` (or until cancelled), then return matches, fail, or panic. A shared
//! [`MockProbe`] records how many invocations started, finished, or were interrupted.

use crate::types::{EngineError, EngineOutput, RecognitionEngine, SampleHandle};
use async_trait::async_trait;
use singsync_common::{ErrorKind, SongMatch};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the mock does once its delay elapses
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// `ok: true` with these matches
    Matches(Vec<SongMatch>),
    /// `ok: false` with this error kind
    Fail(ErrorKind),
    /// Panic inside the engine
    Panic,
}

/// Invocation counters shared between a mock and the test observing it
#[derive(Debug, Default)]
pub struct MockProbe {
    started: AtomicUsize,
    finished: AtomicUsize,
    interrupted: AtomicUsize,
}

impl MockProbe {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Invocations that stopped early: cancelled, or dropped mid-flight
    pub fn interrupted(&self) -> usize {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// Marks an invocation interrupted unless it runs to completion
struct InFlight {
    probe: Arc<MockProbe>,
    completed: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.completed {
            self.probe.finished.fetch_add(1, Ordering::SeqCst);
        } else {
            self.probe.interrupted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct MockEngine {
    name: String,
    delay: Duration,
    behavior: MockBehavior,
    honor_cancel: bool,
    default_timeout: Option<Duration>,
    probe: Arc<MockProbe>,
}

impl MockEngine {
    /// Immediate `ok: true` with no matches
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            behavior: MockBehavior::Matches(Vec::new()),
            honor_cancel: true,
            default_timeout: None,
            probe: Arc::new(MockProbe::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn returning(self, matches: Vec<SongMatch>) -> Self {
        self.with_behavior(MockBehavior::Matches(matches))
    }

    pub fn failing(self, kind: ErrorKind) -> Self {
        self.with_behavior(MockBehavior::Fail(kind))
    }

    /// Keep sleeping through cancellation (a badly behaved engine)
    pub fn ignoring_cancel(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Counters for this engine's invocations
    pub fn probe(&self) -> Arc<MockProbe> {
        Arc::clone(&self.probe)
    }
}

#[async_trait]
impl RecognitionEngine for MockEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    async fn recognize(
        &self,
        _sample: &SampleHandle,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        self.probe.started.fetch_add(1, Ordering::SeqCst);
        let mut in_flight = InFlight {
            probe: Arc::clone(&self.probe),
            completed: false,
        };

        if self.honor_cancel {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        } else {
            tokio::time::sleep(self.delay).await;
        }

        in_flight.completed = true;
        match &self.behavior {
            MockBehavior::Matches(matches) => Ok(EngineOutput::matches(matches.clone())),
            MockBehavior::Fail(kind) => Err(EngineError::from_kind(*kind, "mock failure")),
            MockBehavior::Panic => panic!("mock engine '{}' panicked", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SampleHandle {
        SampleHandle::from_bytes("clip.wav", Vec::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_returns_after_delay() {
        let engine = MockEngine::new("m")
            .with_delay(Duration::from_secs(2))
            .returning(vec![SongMatch::new("Song", "Artist", 0.4)]);
        let probe = engine.probe();

        let output = engine.recognize(&sample(), &CancellationToken::new()).await.unwrap();

        assert_eq!(output.matches.len(), 1);
        assert_eq!(probe.started(), 1);
        assert_eq!(probe.finished(), 1);
        assert_eq!(probe.interrupted(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_observes_cancellation() {
        let engine = MockEngine::new("m").with_delay(Duration::from_secs(60));
        let probe = engine.probe();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine.recognize(&sample(), &cancel).await;

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(probe.interrupted(), 1);
        assert_eq!(probe.finished(), 0);
    }

    #[tokio::test]
    async fn test_mock_failure_kind() {
        let engine = MockEngine::new("m").failing(ErrorKind::NoMatch);
        let err = engine
            .recognize(&sample(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoMatch);
    }
}
