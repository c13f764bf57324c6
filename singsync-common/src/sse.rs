//! Server-Sent Events (SSE) utilities
//!
//! Packs run events as SSE frames: `event: <type>` plus the JSON body as `data`.

use crate::events::RunEvent;
use axum::response::sse::{Event, KeepAlive};
use std::time::Duration;

/// Heartbeat interval for idle SSE connections
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Convert a run event into an SSE frame
///
/// # Errors
/// Returns the serialization error if the event cannot be encoded as JSON.
pub fn run_event_frame(event: &RunEvent) -> Result<Event, serde_json::Error> {
    let data = serde_json::to_string(event)?;
    Ok(Event::default().event(event.event_type()).data(data))
}

/// Keep-alive configuration shared by all SSE endpoints
pub fn heartbeat() -> KeepAlive {
    KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("heartbeat")
}
