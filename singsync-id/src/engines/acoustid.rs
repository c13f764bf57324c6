//! Fingerprint engine: Chromaprint + AcoustID
//!
//! 1. Run `fpcalc -json` on the sample (in-memory samples are spilled to a temp file)
//! 2. Look the fingerprint up on AcoustID with `meta=recordings`
//! 3. Each titled recording becomes a match scored by the AcoustID result score
//!
//! An unknown fingerprint is not a failure: the card is `ok: true` with no matches and a
//! `no_match` warning.
//!
//! AcoustID allows 3 requests per second per client; lookups wait on a `governor` limiter.
//!
//! API Documentation: https://acoustid.org/webservice

use crate::types::{EngineError, EngineOutput, RecognitionEngine, SampleHandle};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use singsync_common::config::AcoustIdConfig;
use singsync_common::{ErrorKind, SongMatch};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub const ENGINE_NAME: &str = "acoustid";

const REQUESTS_PER_SECOND: u32 = 3;
const MAX_MATCHES: usize = 5;
const LYRICS_SEARCH_URL: &str = "https://genius.com/search";
/// AcoustID error code for an invalid client key
const INVALID_API_KEY_CODE: i64 = 4;

/// `fpcalc -json` output
#[derive(Debug, Deserialize)]
struct Fingerprint {
    duration: f64,
    fingerprint: String,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    status: String,
    #[serde(default)]
    results: Vec<LookupResult>,
    error: Option<LookupError>,
}

#[derive(Debug, Deserialize)]
struct LookupError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct LookupResult {
    #[serde(default)]
    score: f64,
    recordings: Option<Vec<Recording>>,
}

#[derive(Debug, Deserialize)]
struct Recording {
    title: Option<String>,
    artists: Option<Vec<Artist>>,
}

#[derive(Debug, Deserialize)]
struct Artist {
    name: String,
}

pub struct AcoustIdEngine {
    http_client: Client,
    endpoint: String,
    api_key: Option<String>,
    fpcalc_bin: String,
    rate_limiter: RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl AcoustIdEngine {
    pub fn from_config(config: &AcoustIdConfig) -> Result<Self, EngineError> {
        let http_client = Client::builder()
            .user_agent(concat!("singsync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| EngineError::Internal(format!("HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(REQUESTS_PER_SECOND).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            fpcalc_bin: config.fpcalc_bin.clone(),
            rate_limiter: RateLimiter::direct(Quota::per_second(per_second)),
        })
    }

    /// Run `fpcalc` on a file-backed sample
    async fn fingerprint(&self, sample: &SampleHandle) -> Result<Fingerprint, EngineError> {
        let spilled;
        let path: PathBuf = match sample.path() {
            Some(path) => path.to_path_buf(),
            None => {
                spilled = spill_to_temp(sample).await?;
                spilled
                    .path()
                    .map(|p| p.to_path_buf())
                    .ok_or_else(|| EngineError::Internal("spilled sample has no path".into()))?
            }
        };

        let output = Command::new(&self.fpcalc_bin)
            .arg("-json")
            .arg(&path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    EngineError::NotAvailable(format!("{} not found", self.fpcalc_bin))
                }
                _ => EngineError::Internal(format!("Failed to execute fpcalc: {}", e)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::UnsupportedInput(format!(
                "fpcalc failed: {}",
                stderr.trim()
            )));
        }

        parse_fpcalc_output(&output.stdout)
    }

    async fn lookup(&self, api_key: &str, fp: &Fingerprint) -> Result<LookupResponse, EngineError> {
        self.rate_limiter.until_ready().await;

        let duration = (fp.duration.round() as u64).to_string();
        let params = [
            ("client", api_key),
            ("meta", "recordings"),
            ("duration", duration.as_str()),
            ("fingerprint", fp.fingerprint.as_str()),
        ];

        debug!(duration_seconds = %duration, "Querying AcoustID API");

        let response = self
            .http_client
            .post(&self.endpoint)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let body: LookupResponse = response.json().await.map_err(|e| {
            EngineError::Parse(format!("AcoustID response (HTTP {}): {}", status.as_u16(), e))
        })?;
        Ok(body)
    }
}

#[async_trait]
impl RecognitionEngine for AcoustIdEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    async fn recognize(
        &self,
        sample: &SampleHandle,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| EngineError::MissingCredentials("ACOUSTID_API_KEY not set".into()))?;

        // Dropping the fpcalc future kills the child process
        let fingerprint = tokio::select! {
            result = self.fingerprint(sample) => result?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        let response = tokio::select! {
            result = self.lookup(api_key, &fingerprint) => result?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        let matches = matches_from_response(response)?;
        info!(engine = ENGINE_NAME, matches = matches.len(), "AcoustID lookup finished");

        let raw = json!({ "duration": fingerprint.duration });
        if matches.is_empty() {
            return Ok(EngineOutput::empty()
                .with_raw(raw)
                .with_warning(ErrorKind::NoMatch, "AcoustID returned no recordings"));
        }
        Ok(EngineOutput::matches(matches).with_raw(raw))
    }
}

/// Write an in-memory sample to a temporary file, removed when the handle drops
async fn spill_to_temp(sample: &SampleHandle) -> Result<SampleHandle, EngineError> {
    let bytes = sample.read_bytes().await?;
    let extension = sample.extension().unwrap_or_else(|| "bin".to_string());
    let path = std::env::temp_dir().join(format!(
        "singsync-fp-{}.{}",
        Uuid::new_v4().simple(),
        extension
    ));
    tokio::fs::write(&path, &*bytes).await?;
    Ok(SampleHandle::temporary_file(path))
}

fn parse_fpcalc_output(stdout: &[u8]) -> Result<Fingerprint, EngineError> {
    let fp: Fingerprint = serde_json::from_slice(stdout)
        .map_err(|e| EngineError::Parse(format!("fpcalc output: {}", e)))?;
    if fp.fingerprint.is_empty() {
        return Err(EngineError::UnsupportedInput("empty fingerprint".into()));
    }
    Ok(fp)
}

fn matches_from_response(response: LookupResponse) -> Result<Vec<SongMatch>, EngineError> {
    if response.status != "ok" {
        return Err(match response.error {
            Some(err) if err.code == INVALID_API_KEY_CODE => {
                EngineError::MissingCredentials(format!("AcoustID: {}", err.message))
            }
            Some(err) => EngineError::Api(format!("AcoustID error {}: {}", err.code, err.message)),
            None => EngineError::Api(format!("AcoustID status '{}'", response.status)),
        });
    }

    let matches: Vec<SongMatch> = response
        .results
        .into_iter()
        .flat_map(|result| {
            let score = result.score as f32;
            result
                .recordings
                .unwrap_or_default()
                .into_iter()
                .filter_map(move |recording| recording_match(recording, score))
        })
        .take(MAX_MATCHES)
        .collect();

    Ok(matches)
}

fn recording_match(recording: Recording, score: f32) -> Option<SongMatch> {
    let title = recording.title.filter(|t| !t.is_empty())?;
    let artist = recording
        .artists
        .and_then(|artists| artists.into_iter().next())
        .map(|a| a.name)
        .unwrap_or_default();

    let query = format!("{} {}", artist, title);
    let song = SongMatch::new(title, artist, score);
    Some(match reqwest::Url::parse_with_params(LYRICS_SEARCH_URL, [("q", query.trim())]) {
        Ok(url) => song.with_url(url),
        Err(_) => song,
    })
}
