//! Delivery modes over the orchestrator
//!
//! [`IdentifyService`] is the boundary the HTTP layer talks to:
//! - `submit`: register a sample, get a token
//! - `start_incremental`: stream cards as engines finish, then a terminal marker
//! - `start_aggregate`: run to completion, merge, return one ranked list
//! - `text_search`: single lyrics lookup, no fan-out
//!
//! Request-level errors (unknown token, nothing to run) are returned before any engine
//! starts. A sample's token is released once a run using it is terminal.

use crate::engines::genius::LyricsSearch;
use crate::engines::EngineRegistry;
use crate::error::IdentifyError;
use crate::merger::ResultMerger;
use crate::orchestrator::{Orchestrator, RunOutcome, RunRequest};
use crate::store::SampleStore;
use crate::types::{EngineError, SampleHandle};
use futures::Stream;
use serde::Serialize;
use singsync_common::{RankedMatch, ResultCard, RunEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ServiceInner {
    store: SampleStore,
    registry: EngineRegistry,
    orchestrator: Orchestrator,
    merger: ResultMerger,
    lyrics: Option<Arc<dyn LyricsSearch>>,
}

/// Identification service shared by all request handlers
#[derive(Clone)]
pub struct IdentifyService {
    inner: Arc<ServiceInner>,
}

/// Handle to a running incremental identification
///
/// Dropping it (or calling [`IncrementalRun::cancel`]) tears the run down: pending engines
/// are cancelled and no further events are produced.
pub struct IncrementalRun {
    events: mpsc::UnboundedReceiver<RunEvent>,
    cancel: CancellationToken,
    disconnect: DropGuard,
}

impl IncrementalRun {
    /// Next event; `None` after the terminal marker or after cancellation
    pub async fn next(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Consume as a stream; dropping the stream disconnects the run
    pub fn into_stream(self) -> impl Stream<Item = RunEvent> + Send + 'static {
        let IncrementalRun {
            mut events,
            disconnect,
            ..
        } = self;
        async_stream::stream! {
            let _disconnect = disconnect;
            while let Some(event) = events.recv().await {
                yield event;
            }
        }
    }
}

/// Releases a token when dropped before [`TokenRelease::now`] ran
///
/// Covers callers that drop an aggregate run mid-flight.
struct TokenRelease {
    store: SampleStore,
    token: Option<String>,
}

impl TokenRelease {
    fn new(store: SampleStore, token: &str) -> Self {
        Self {
            store,
            token: Some(token.to_string()),
        }
    }

    async fn now(mut self) {
        if let Some(token) = self.token.take() {
            self.store.remove(&token).await;
        }
    }
}

impl Drop for TokenRelease {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let store = self.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    store.remove(&token).await;
                });
            }
            Err(_) => debug!(token = %token, "No runtime to release token; left to the sweeper"),
        }
    }
}

/// Result of an aggregate run
#[derive(Debug, Clone, Serialize)]
pub struct AggregateResult {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    /// Per-engine cards in completion order
    pub cards: Vec<ResultCard>,
    /// Merged ranking; empty when nothing was found
    pub matches: Vec<RankedMatch>,
}

impl IdentifyService {
    pub fn new(
        store: SampleStore,
        registry: EngineRegistry,
        orchestrator: Orchestrator,
        merger: ResultMerger,
        lyrics: Option<Arc<dyn LyricsSearch>>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                store,
                registry,
                orchestrator,
                merger,
                lyrics,
            }),
        }
    }

    pub fn store(&self) -> &SampleStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.inner.registry
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    pub fn has_text_search(&self) -> bool {
        self.inner
            .lyrics
            .as_ref()
            .map(|l| l.is_configured())
            .unwrap_or(false)
    }

    /// Register a sample; does not start a run
    pub async fn submit(&self, sample: SampleHandle) -> String {
        self.inner.store.insert(sample).await
    }

    /// Resolve token and engine selection, or fail before anything starts
    async fn prepare(
        &self,
        token: &str,
        engines: Option<&[String]>,
        global_timeout: Option<Duration>,
    ) -> Result<RunRequest, IdentifyError> {
        let sample = self
            .inner
            .store
            .get(token)
            .await
            .ok_or_else(|| IdentifyError::InvalidToken(token.to_string()))?;
        let engines = self.inner.registry.select(engines)?;
        Ok(RunRequest {
            sample,
            engines,
            global_timeout,
        })
    }

    /// Start a run whose cards are delivered as they complete
    pub async fn start_incremental(
        &self,
        token: &str,
        engines: Option<&[String]>,
        global_timeout: Option<Duration>,
    ) -> Result<IncrementalRun, IdentifyError> {
        let request = self.prepare(token, engines, global_timeout).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let service = self.clone();
        let run_cancel = cancel.clone();
        let token = token.to_string();

        tokio::spawn(async move {
            let summary = service
                .inner
                .orchestrator
                .run(request, Some(tx), run_cancel)
                .await;
            service.inner.store.remove(&token).await;
            debug!(
                run_id = %summary.run_id,
                outcome = ?summary.outcome,
                "Incremental run released its sample"
            );
        });

        Ok(IncrementalRun {
            events: rx,
            disconnect: cancel.clone().drop_guard(),
            cancel,
        })
    }

    /// Run to completion and merge every card into one ranked list
    pub async fn start_aggregate(
        &self,
        token: &str,
        engines: Option<&[String]>,
        global_timeout: Option<Duration>,
    ) -> Result<AggregateResult, IdentifyError> {
        let request = self.prepare(token, engines, global_timeout).await?;

        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let release = TokenRelease::new(self.inner.store.clone(), token);
        let summary = self.inner.orchestrator.run(request, None, cancel).await;
        release.now().await;

        let matches = self.inner.merger.merge(&summary.cards);
        info!(
            run_id = %summary.run_id,
            cards = summary.cards.len(),
            matches = matches.len(),
            "Aggregate run merged"
        );

        Ok(AggregateResult {
            run_id: summary.run_id,
            outcome: summary.outcome,
            cards: summary.cards,
            matches,
        })
    }

    /// Lyrics lookup for a free-text query
    pub async fn text_search(&self, query: &str) -> Result<Vec<RankedMatch>, IdentifyError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(IdentifyError::InvalidInput("query must not be empty".into()));
        }

        let lyrics = self
            .inner
            .lyrics
            .as_ref()
            .ok_or_else(|| IdentifyError::TextSearchUnavailable("no lyrics backend".into()))?;

        let matches = lyrics.search(query).await.map_err(|e| match e {
            EngineError::MissingCredentials(msg) => IdentifyError::TextSearchUnavailable(msg),
            other => {
                warn!(error = %other, "Text search failed");
                IdentifyError::Upstream(other.to_string())
            }
        })?;

        let source = lyrics.name().to_string();
        let mut ranked: Vec<RankedMatch> = matches
            .into_iter()
            .map(|m| RankedMatch::new(m.clamped(), source.clone()))
            .collect();
        // Stable: equal confidences keep the backend's order
        ranked.sort_by(|a, b| b.song.confidence.total_cmp(&a.song.confidence));
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::mock::MockEngine;
    use async_trait::async_trait;
    use singsync_common::SongMatch;
    use std::sync::Arc;

    struct FakeLyrics {
        result: fn() -> Result<Vec<SongMatch>, EngineError>,
    }

    #[async_trait]
    impl LyricsSearch for FakeLyrics {
        fn name(&self) -> &str {
            "genius"
        }

        fn is_configured(&self) -> bool {
            true
        }

        async fn search(&self, _query: &str) -> Result<Vec<SongMatch>, EngineError> {
            (self.result)()
        }
    }

    fn service_with(engine: MockEngine, lyrics: Option<Arc<dyn LyricsSearch>>) -> IdentifyService {
        let mut registry = EngineRegistry::new();
        registry.register(Arc::new(engine), true);
        IdentifyService::new(
            SampleStore::new(),
            registry,
            Orchestrator::default(),
            ResultMerger::default(),
            lyrics,
        )
    }

    fn service() -> IdentifyService {
        service_with(MockEngine::new("a"), None)
    }

    fn with_lyrics(result: fn() -> Result<Vec<SongMatch>, EngineError>) -> IdentifyService {
        service_with(MockEngine::new("a"), Some(Arc::new(FakeLyrics { result })))
    }

    #[tokio::test]
    async fn test_aggregate_releases_token() {
        let service = service();
        let token = service
            .submit(SampleHandle::from_bytes("clip.wav", vec![0u8; 4]))
            .await;

        let result = service.start_aggregate(&token, None, None).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(result.cards.len(), 1);
        assert!(!service.store().contains(&token).await);
    }

    #[tokio::test]
    async fn test_text_search_validation() {
        let service = service();
        assert!(matches!(
            service.text_search("   ").await,
            Err(IdentifyError::InvalidInput(_))
        ));
        assert!(matches!(
            service.text_search("yesterday").await,
            Err(IdentifyError::TextSearchUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_text_search_ranks_hits() {
        let service = with_lyrics(|| {
            Ok(vec![
                SongMatch::new("Yesterday", "The Beatles", 0.6),
                SongMatch::new("Yesterday Once More", "Carpenters", 0.6),
                SongMatch::new("Let It Be", "The Beatles", 1.7),
            ])
        });
        assert!(service.has_text_search());

        let matches = service.text_search("  yesterday  ").await.unwrap();

        let titles: Vec<&str> = matches.iter().map(|m| m.song.title.as_str()).collect();
        assert_eq!(titles, vec!["Let It Be", "Yesterday", "Yesterday Once More"]);
        assert!(matches.iter().all(|m| m.source == "genius"));
        assert_eq!(matches[0].song.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_text_search_no_hits_is_empty() {
        let service = with_lyrics(|| Ok(Vec::new()));
        assert!(service.text_search("zzzz").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_text_search_error_mapping() {
        let service = with_lyrics(|| Err(EngineError::Api("HTTP 500".into())));
        assert!(matches!(
            service.text_search("yesterday").await,
            Err(IdentifyError::Upstream(_))
        ));

        let service = with_lyrics(|| Err(EngineError::MissingCredentials("no token".into())));
        assert!(matches!(
            service.text_search("yesterday").await,
            Err(IdentifyError::TextSearchUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_aggregate_releases_token() {
        let engine = MockEngine::new("a").with_delay(Duration::from_secs(20));
        let probe = engine.probe();
        let service = service_with(engine, None);
        let token = service
            .submit(SampleHandle::from_bytes("clip.wav", vec![0u8; 4]))
            .await;

        // Caller goes away mid-run
        let pending = {
            let service = service.clone();
            let token = token.clone();
            tokio::spawn(async move { service.start_aggregate(&token, None, None).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        pending.abort();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!service.store().contains(&token).await);
        assert_eq!(probe.interrupted(), 1);
        assert_eq!(probe.finished(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_with_huge_timeout_completes() {
        let service = service();
        let token = service
            .submit(SampleHandle::from_bytes("clip.wav", vec![0u8; 4]))
            .await;

        let result = service
            .start_aggregate(&token, None, Some(Duration::from_secs(u64::MAX / 2)))
            .await
            .unwrap();

        assert_eq!(result.outcome, RunOutcome::Completed);
        assert!(!service.store().contains(&token).await);
    }
}
