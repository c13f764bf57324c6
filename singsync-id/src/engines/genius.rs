//! Genius lyrics search client
//!
//! Shared by the `whisper_genius` engine (transcript lookup) and free-text search.
//!
//! API Documentation: https://docs.genius.com/#search-h2

use crate::types::EngineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use singsync_common::config::GeniusConfig;
use singsync_common::SongMatch;
use std::time::Duration;
use tracing::debug;

/// Fixed confidence for a lyrics hit; Genius does not score its results
pub const LYRICS_CONFIDENCE: f32 = 0.6;

const USER_AGENT: &str = concat!("singsync/", env!("CARGO_PKG_VERSION"));

/// Lyrics search backend
#[async_trait]
pub trait LyricsSearch: Send + Sync {
    /// Backend name used as match provenance
    fn name(&self) -> &str;

    /// Whether credentials are configured
    fn is_configured(&self) -> bool;

    /// Search lyrics; results are in backend rank order
    ///
    /// # Errors
    /// `MissingCredentials` when no token is configured, `Api`/`Network`/`Parse` on
    /// upstream failure.
    async fn search(&self, query: &str) -> Result<Vec<SongMatch>, EngineError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    response: SearchBody,
}

#[derive(Debug, Default, Deserialize)]
struct SearchBody {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    result: HitResult,
}

#[derive(Debug, Deserialize)]
struct HitResult {
    #[serde(default)]
    title: String,
    url: Option<String>,
    song_art_image_thumbnail_url: Option<String>,
    primary_artist: Option<PrimaryArtist>,
}

#[derive(Debug, Deserialize)]
struct PrimaryArtist {
    #[serde(default)]
    name: String,
}

impl From<HitResult> for SongMatch {
    fn from(hit: HitResult) -> Self {
        let artist = hit.primary_artist.map(|a| a.name).unwrap_or_default();
        let mut song = SongMatch::new(hit.title, artist, LYRICS_CONFIDENCE);
        if let Some(url) = hit.url {
            song = song.with_url(url);
        }
        if let Some(image) = hit.song_art_image_thumbnail_url {
            song = song.with_image_url(image);
        }
        song
    }
}

/// Genius search API client
pub struct GeniusClient {
    http_client: Client,
    endpoint: String,
    api_token: Option<String>,
    max_results: usize,
}

impl GeniusClient {
    pub fn from_config(config: &GeniusConfig) -> Result<Self, EngineError> {
        let http_client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| EngineError::Internal(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
            api_token: config.api_token.clone().filter(|t| !t.trim().is_empty()),
            max_results: config.max_results,
        })
    }
}

#[async_trait]
impl LyricsSearch for GeniusClient {
    fn name(&self) -> &str {
        "genius"
    }

    fn is_configured(&self) -> bool {
        self.api_token.is_some()
    }

    async fn search(&self, query: &str) -> Result<Vec<SongMatch>, EngineError> {
        let token = self
            .api_token
            .as_deref()
            .ok_or_else(|| EngineError::MissingCredentials("GENIUS_API_TOKEN not set".into()))?;

        debug!(query_len = query.len(), "Querying Genius search");

        let response = self
            .http_client
            .get(&self.endpoint)
            .bearer_auth(token)
            .query(&[("q", query)])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EngineError::MissingCredentials(
                "Genius rejected the API token".into(),
            ));
        }
        if !status.is_success() {
            return Err(EngineError::Api(format!("Genius API error {}", status.as_u16())));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Parse(e.to_string()))?;

        Ok(parse_hits(body, self.max_results))
    }
}

fn parse_hits(body: SearchResponse, max_results: usize) -> Vec<SongMatch> {
    body.response
        .hits
        .into_iter()
        .take(max_results)
        .map(|hit| SongMatch::from(hit.result))
        .collect()
}
