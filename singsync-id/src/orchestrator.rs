//! Identification run orchestrator
//!
//! Fans one sample out to every selected engine under a shared absolute deadline and
//! reports result cards in completion order.
//!
//! # Run lifecycle
//! 1. Spawn one task per engine; record start and compute `deadline = start + timeout`
//! 2. Wait for whichever comes first: caller cancel, sink closed, next completion, deadline
//! 3. Forward each completed card to the sink immediately
//! 4. Deadline: cancel and abort pending engines, synthesize `timeout` cards, emit them,
//!    then emit the `timeout` marker
//! 5. All cards in: emit the `done` marker
//! 6. Caller cancel or sink closed: cancel pending engines and stop without a marker
//!
//! [`RunState`] is owned by the loop in [`Orchestrator::run`]; engine tasks never touch it.
//! Dropping the run (any exit path, including the caller dropping the future) cancels and
//! aborts every engine still pending.

use crate::engines::{self, RegisteredEngine};
use crate::types::SampleHandle;
use futures::stream::{FuturesUnordered, StreamExt};
use singsync_common::{ErrorKind, ResultCard, RunEvent};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Global deadline used when neither the request nor configuration gives one
pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on any run's deadline; longer requests are clamped
pub const MAX_GLOBAL_TIMEOUT: Duration = Duration::from_secs(3600);

/// Receiver side of a run's event stream
pub type EventSink = mpsc::UnboundedSender<RunEvent>;

/// Engines to run against one sample
pub struct RunRequest {
    pub sample: SampleHandle,
    pub engines: Vec<RegisteredEngine>,
    /// Overrides the orchestrator's default global timeout
    pub global_timeout: Option<Duration>,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every engine produced its own card
    Completed,
    /// Deadline reached; pending engines got synthetic timeout cards
    TimedOut,
    /// Caller cancelled or disconnected; `cards` holds what arrived before that
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Cards in emission order
    pub cards: Vec<ResultCard>,
    pub outcome: RunOutcome,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Engines that were cut off by the deadline
    pub fn timed_out(&self) -> impl Iterator<Item = &str> {
        self.cards
            .iter()
            .filter(|c| c.error_kind() == Some(ErrorKind::Timeout))
            .map(|c| c.source.as_str())
    }
}

/// Engine still running in a run
struct PendingEngine {
    name: String,
    cancel: CancellationToken,
    abort: AbortHandle,
}

/// Per-run state, single writer
struct RunState {
    /// Keyed by launch slot so synthetic cards come out in selection order
    pending: BTreeMap<usize, PendingEngine>,
    completed: Vec<ResultCard>,
    deadline: Instant,
    cancelled: bool,
}

impl RunState {
    /// Stop every pending engine and return their names in slot order
    fn cut_off_pending(&mut self) -> Vec<String> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_values()
            .map(|p| {
                p.cancel.cancel();
                p.abort.abort();
                p.name
            })
            .collect()
    }
}

impl Drop for RunState {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(pending = self.pending.len(), "Run dropped with engines pending");
            self.cut_off_pending();
        }
    }
}

/// Concurrent fan-out over recognition engines
#[derive(Debug, Clone)]
pub struct Orchestrator {
    default_timeout: Duration,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(DEFAULT_GLOBAL_TIMEOUT)
    }
}

impl Orchestrator {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run every engine in `request` to a terminal state
    ///
    /// Events go to `sink` as they happen. The returned summary holds the same cards in
    /// the same order. Cancelling `cancel` or dropping the sink's receiver tears the run
    /// down without a terminal marker.
    pub async fn run(
        &self,
        request: RunRequest,
        sink: Option<EventSink>,
        cancel: CancellationToken,
    ) -> RunSummary {
        let run_id = Uuid::new_v4();
        let timeout = request
            .global_timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.default_timeout)
            .min(MAX_GLOBAL_TIMEOUT);
        let timeout_secs = timeout.as_secs_f64();
        let start = Instant::now();

        let mut state = RunState {
            pending: BTreeMap::new(),
            completed: Vec::with_capacity(request.engines.len()),
            deadline: start + timeout,
            cancelled: false,
        };

        info!(
            run_id = %run_id,
            engines = request.engines.len(),
            timeout_secs,
            "Starting identification run"
        );

        let mut inflight = FuturesUnordered::new();
        for (slot, entry) in request.engines.into_iter().enumerate() {
            let name = entry.name().to_string();
            let engine_cancel = cancel.child_token();
            let engine_deadline = entry
                .descriptor
                .timeout_override
                .filter(|t| *t < timeout)
                .map(|t| start + t);

            let handle = tokio::spawn(run_engine(
                entry,
                request.sample.clone(),
                engine_cancel.clone(),
                start,
                engine_deadline,
            ));
            state.pending.insert(
                slot,
                PendingEngine {
                    name,
                    cancel: engine_cancel,
                    abort: handle.abort_handle(),
                },
            );
            inflight.push(async move { (slot, handle.await) });
        }

        let outcome = loop {
            if state.pending.is_empty() {
                let elapsed = start.elapsed().as_secs_f64().min(timeout_secs);
                emit(
                    &sink,
                    RunEvent::Done {
                        cards: state.completed.len(),
                        elapsed_seconds: elapsed,
                    },
                );
                break RunOutcome::Completed;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(run_id = %run_id, "Run cancelled by caller");
                    break RunOutcome::Cancelled;
                }

                _ = sink_closed(&sink) => {
                    info!(run_id = %run_id, "Event receiver gone, cancelling run");
                    break RunOutcome::Cancelled;
                }

                Some((slot, joined)) = inflight.next() => {
                    let Some(pending) = state.pending.remove(&slot) else {
                        continue;
                    };
                    let mut card = match joined {
                        Ok(card) => card,
                        Err(e) => {
                            warn!(engine = %pending.name, error = %e, "Engine task failed");
                            ResultCard::failure(
                                pending.name,
                                ErrorKind::InternalError,
                                format!("engine task failed: {}", e),
                                start.elapsed().as_secs_f64(),
                            )
                        }
                    };
                    card.elapsed_seconds = card.elapsed_seconds.min(timeout_secs);

                    debug!(run_id = %run_id, engine = %card.source, ok = card.ok, "Card ready");
                    state.completed.push(card.clone());
                    if !emit(&sink, RunEvent::Card(card)) {
                        state.cancelled = true;
                    }
                }

                _ = tokio::time::sleep_until(state.deadline) => {
                    let timed_out = state.cut_off_pending();
                    warn!(run_id = %run_id, timed_out = ?timed_out, "Run deadline reached");

                    for name in &timed_out {
                        let card = ResultCard::failure(
                            name.clone(),
                            ErrorKind::Timeout,
                            format!("no result within {:.1}s", timeout_secs),
                            timeout_secs,
                        );
                        state.completed.push(card.clone());
                        emit(&sink, RunEvent::Card(card));
                    }
                    emit(
                        &sink,
                        RunEvent::Timeout {
                            cards: state.completed.len(),
                            timed_out,
                            elapsed_seconds: timeout_secs,
                        },
                    );
                    break RunOutcome::TimedOut;
                }
            }

            if state.cancelled {
                info!(run_id = %run_id, "Event receiver gone, cancelling run");
                break RunOutcome::Cancelled;
            }
        };

        if outcome == RunOutcome::Cancelled {
            state.cut_off_pending();
        }

        let elapsed = start.elapsed();
        info!(
            run_id = %run_id,
            outcome = ?outcome,
            cards = state.completed.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Identification run finished"
        );

        RunSummary {
            run_id,
            cards: std::mem::take(&mut state.completed),
            outcome,
            elapsed,
        }
    }
}

/// One engine task: invoke the engine, cut off at its own deadline if it has one
async fn run_engine(
    entry: RegisteredEngine,
    sample: SampleHandle,
    cancel: CancellationToken,
    start: Instant,
    engine_deadline: Option<Instant>,
) -> ResultCard {
    let invocation = engines::invoke(entry.engine.as_ref(), &sample, &cancel);

    let Some(deadline) = engine_deadline else {
        return invocation.await;
    };

    match tokio::time::timeout_at(deadline, invocation).await {
        Ok(card) => card,
        Err(_) => {
            cancel.cancel();
            let limit = deadline.duration_since(start).as_secs_f64();
            debug!(engine = %entry.name(), limit_secs = limit, "Engine timeout reached");
            ResultCard::failure(
                entry.name(),
                ErrorKind::Timeout,
                format!("engine timeout of {:.1}s reached", limit),
                limit,
            )
        }
    }
}

/// Send an event; false once the receiver is gone
fn emit(sink: &Option<EventSink>, event: RunEvent) -> bool {
    match sink {
        Some(tx) => tx.send(event).is_ok(),
        None => true,
    }
}

/// Resolves when the sink's receiver is dropped; never without a sink
async fn sink_closed(sink: &Option<EventSink>) {
    match sink {
        Some(tx) => tx.closed().await,
        None => std::future::pending().await,
    }
}
