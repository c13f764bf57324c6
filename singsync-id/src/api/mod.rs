//! HTTP API handlers for singsync-id
//!
//! Thin layer over [`IdentifyService`](crate::delivery::IdentifyService): parse the request,
//! call the service, shape the JSON. Errors go through [`ApiError`](crate::ApiError).

pub mod health;
pub mod identify;
pub mod sse;

pub use health::health_routes;
pub use identify::identify_routes;
pub use sse::identify_stream;

use crate::error::IdentifyError;
use crate::orchestrator::MAX_GLOBAL_TIMEOUT;
use serde::Deserialize;
use std::time::Duration;

/// Query parameters shared by the run endpoints
#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    #[serde(default)]
    pub token: String,
    /// Comma-separated engine names; all enabled engines when absent
    pub engines: Option<String>,
    /// Global timeout in seconds
    pub timeout: Option<f64>,
}

impl RunQuery {
    /// Explicit engine selection, if one was given
    pub fn engine_list(&self) -> Option<Vec<String>> {
        let names: Vec<String> = self
            .engines
            .as_deref()?
            .split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            None
        } else {
            Some(names)
        }
    }

    /// Requested global timeout; must be positive and at most [`MAX_GLOBAL_TIMEOUT`]
    pub fn global_timeout(&self) -> Result<Option<Duration>, IdentifyError> {
        let Some(secs) = self.timeout else {
            return Ok(None);
        };
        match Duration::try_from_secs_f64(secs) {
            Ok(timeout) if !timeout.is_zero() && timeout <= MAX_GLOBAL_TIMEOUT => Ok(Some(timeout)),
            _ => Err(IdentifyError::InvalidInput(format!(
                "timeout must be between 0 and {} seconds, got {}",
                MAX_GLOBAL_TIMEOUT.as_secs(),
                secs
            ))),
        }
    }
}
