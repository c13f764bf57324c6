//! singsync-id library interface
//!
//! Song identification service: one audio sample is fanned out to several recognition
//! engines under a shared deadline, and their result cards are streamed or merged into
//! one ranked list.
//!
//! Exposes public APIs for integration testing.

pub mod api;
pub mod delivery;
pub mod engines;
pub mod error;
pub mod merger;
pub mod orchestrator;
pub mod store;
pub mod types;

pub use crate::error::{ApiError, ApiResult, IdentifyError};

use axum::Router;
use chrono::{DateTime, Utc};
use delivery::IdentifyService;
use singsync_common::config::TomlConfig;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: IdentifyService,
    /// Effective configuration (TOML + environment)
    pub config: Arc<TomlConfig>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(service: IdentifyService, config: TomlConfig) -> Self {
        Self {
            service,
            config: Arc::new(config),
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::identify_routes())
        .merge(api::health_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
