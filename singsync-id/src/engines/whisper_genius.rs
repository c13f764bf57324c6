//! Transcribe-then-search engine
//!
//! Sends the sample to an OpenAI-compatible transcription endpoint, then searches the
//! transcript as lyrics. The transcript is always returned in `raw.transcript`.
//!
//! Degraded path: when lyrics search has no credentials the card stays `ok: true` with no
//! matches and a `missing_credentials` warning, so the transcript still reaches the caller.

use super::genius::LyricsSearch;
use crate::types::{EngineError, EngineOutput, RecognitionEngine, SampleHandle};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use singsync_common::config::WhisperGeniusConfig;
use singsync_common::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ENGINE_NAME: &str = "whisper_genius";

/// Lyrics search queries longer than this are cut at a word boundary
const MAX_QUERY_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

pub struct WhisperGeniusEngine {
    http_client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    language: Option<String>,
    lyrics: Arc<dyn LyricsSearch>,
}

impl WhisperGeniusEngine {
    pub fn from_config(
        config: &WhisperGeniusConfig,
        lyrics: Arc<dyn LyricsSearch>,
    ) -> Result<Self, EngineError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| EngineError::Internal(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint: config.transcription_endpoint.clone(),
            api_key: config.openai_api_key.clone().filter(|k| !k.trim().is_empty()),
            model: config.model.clone(),
            language: config.language.clone(),
            lyrics,
        })
    }

    async fn transcribe(&self, api_key: &str, sample: &SampleHandle) -> Result<String, EngineError> {
        let bytes = sample.read_bytes().await?;
        let part = Part::bytes(bytes.to_vec())
            .file_name(sample.file_name())
            .mime_str("application/octet-stream")?;

        let mut form = Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EngineError::MissingCredentials(
                "transcription service rejected the API key".into(),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api(format!(
                "transcription error {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Parse(e.to_string()))?;
        Ok(parsed.text.trim().to_string())
    }

    /// Look the transcript up as lyrics
    async fn match_transcript(&self, transcript: String) -> Result<EngineOutput, EngineError> {
        let query = search_query(&transcript);

        match self.lyrics.search(query).await {
            Ok(matches) => {
                info!(engine = ENGINE_NAME, matches = matches.len(), "Lyrics search finished");
                let raw = if matches.is_empty() {
                    json!({ "transcript": transcript, "note": "no lyrics results" })
                } else {
                    json!({ "transcript": transcript })
                };
                Ok(EngineOutput::matches(matches).with_raw(raw))
            }
            Err(EngineError::MissingCredentials(msg)) => {
                warn!(engine = ENGINE_NAME, "Lyrics search skipped: {}", msg);
                Ok(EngineOutput::empty()
                    .with_raw(json!({ "transcript": transcript, "note": msg }))
                    .with_warning(ErrorKind::MissingCredentials, msg))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RecognitionEngine for WhisperGeniusEngine {
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
            .ok_or_else(|| EngineError::MissingCredentials("OPENAI_API_KEY not set".into()))?;

        let transcript = tokio::select! {
            result = self.transcribe(api_key, sample) => result?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        if transcript.is_empty() {
            return Err(EngineError::NoMatch("transcription produced no text".into()));
        }
        debug!(engine = ENGINE_NAME, chars = transcript.len(), "Transcript received");

        tokio::select! {
            result = self.match_transcript(transcript) => result,
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }
}

/// Bound the lyrics query, cutting at the last whitespace inside the limit
fn search_query(transcript: &str) -> &str {
    match transcript.char_indices().nth(MAX_QUERY_CHARS) {
        None => transcript,
        Some((cut, _)) => {
            let head = &transcript[..cut];
            match head.rfind(char::is_whitespace) {
                Some(space) if space > 0 => head[..space].trim_end(),
                _ => head,
            }
        }
    }
}
