//! Health check endpoint
//!
//! Reports uptime and engine readiness. Credentials are reported as present/absent only.

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use singsync_common::config::TomlConfig;

use crate::engines::{acoustid, whisper_genius};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct EngineHealth {
    pub name: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    /// Whether the engine's credentials are configured
    pub credentials: bool,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status ("ok", or "degraded" when no engine can run)
    pub status: String,
    /// Module name ("singsync-id")
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    pub global_timeout_secs: f64,
    pub engines: Vec<EngineHealth>,
    pub text_search: bool,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let engines: Vec<EngineHealth> = state
        .service
        .registry()
        .descriptors()
        .into_iter()
        .map(|d| EngineHealth {
            credentials: credentials_present(&state.config, &d.name),
            timeout_secs: d.timeout_override.map(|t| t.as_secs_f64()),
            enabled: d.enabled,
            name: d.name,
        })
        .collect();

    let runnable = engines.iter().any(|e| e.enabled && e.credentials);

    Json(HealthResponse {
        status: if runnable { "ok" } else { "degraded" }.to_string(),
        module: "singsync-id".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        global_timeout_secs: state.service.orchestrator().default_timeout().as_secs_f64(),
        engines,
        text_search: state.service.has_text_search(),
    })
}

/// Credential presence per engine; engines without credentials report `true`
fn credentials_present(config: &TomlConfig, engine: &str) -> bool {
    let present = |v: &Option<String>| v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
    match engine {
        acoustid::ENGINE_NAME => present(&config.engines.acoustid.api_key),
        whisper_genius::ENGINE_NAME => present(&config.engines.whisper_genius.openai_api_key),
        _ => true,
    }
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_present() {
        let mut config = TomlConfig::default();
        assert!(!credentials_present(&config, "acoustid"));
        assert!(credentials_present(&config, "features"));

        config.engines.acoustid.api_key = Some("key".into());
        config.engines.whisper_genius.openai_api_key = Some("  ".into());
        assert!(credentials_present(&config, "acoustid"));
        assert!(!credentials_present(&config, "whisper_genius"));
    }
}
