//! Run event vocabulary
//!
//! An identification run produces one [`RunEvent::Card`] per engine in completion
//! order, followed by exactly one terminal marker ([`RunEvent::Done`] or
//! [`RunEvent::Timeout`]). A run torn down by the caller produces no marker.

use crate::model::ResultCard;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// One engine finished (or was given a synthetic card)
    Card(ResultCard),

    /// Every engine produced its card before the deadline
    Done {
        cards: usize,
        elapsed_seconds: f64,
    },

    /// Deadline reached; `timed_out` lists the engines that were cut off
    Timeout {
        cards: usize,
        timed_out: Vec<String>,
        elapsed_seconds: f64,
    },
}

impl RunEvent {
    /// SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            RunEvent::Card(_) => "card",
            RunEvent::Done { .. } => "done",
            RunEvent::Timeout { .. } => "timeout",
        }
    }

    /// True for the markers that close a run
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunEvent::Card(_))
    }

    pub fn as_card(&self) -> Option<&ResultCard> {
        match self {
            RunEvent::Card(card) => Some(card),
            _ => None,
        }
    }
}
