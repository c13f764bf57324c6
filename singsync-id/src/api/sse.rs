//! Server-Sent Events for incremental identification
//!
//! One `card` event per engine as it finishes, then `done` or `timeout`. Closing the
//! connection drops the stream, which cancels every engine still running.

use super::RunQuery;
use crate::error::ApiResult;
use crate::AppState;
use axum::{
    extract::{Query, State},
    response::sse::{Event, Sse},
};
use futures::stream::{Stream, StreamExt};
use singsync_common::sse::{heartbeat, run_event_frame};
use std::convert::Infallible;
use tracing::{debug, info, warn};

/// GET /identify_stream?token=&engines=&timeout=
///
/// Token and engine selection are validated before the stream opens; failures are plain
/// JSON error responses.
pub async fn identify_stream(
    State(state): State<AppState>,
    Query(query): Query<RunQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let engines = query.engine_list();
    let timeout = query.global_timeout()?;

    let run = state
        .service
        .start_incremental(&query.token, engines.as_deref(), timeout)
        .await?;
    info!(token = %query.token, "SSE client attached to identification run");

    let stream = async_stream::stream! {
        let events = run.into_stream();
        futures::pin_mut!(events);

        while let Some(event) = events.next().await {
            let terminal = event.is_terminal();
            match run_event_frame(&event) {
                Ok(frame) => {
                    debug!("SSE: Sending {} event", event.event_type());
                    yield Ok(frame);
                }
                Err(e) => warn!("SSE: Failed to serialize {} event: {}", event.event_type(), e),
            }
            if terminal {
                break;
            }
        }
        debug!("SSE: Identification stream closed");
    };

    Ok(Sse::new(stream).keep_alive(heartbeat()))
}
