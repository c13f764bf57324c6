//! Result card and song match model
//!
//! Every recognition engine, whatever its native response shape, reports through
//! [`ResultCard`]. Cards carry zero or more [`SongMatch`] candidates, and the merger
//! turns the candidates of a whole run into [`RankedMatch`] entries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error kinds reported on result cards and request-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Engine credentials are not configured
    MissingCredentials,
    /// Engine is switched off in configuration
    Disabled,
    /// Upstream service explicitly reported no match
    NoMatch,
    /// Transport or HTTP failure talking to an upstream service
    UpstreamError,
    /// Engine did not finish before its deadline (assigned by the orchestrator)
    Timeout,
    /// Unknown or expired sample token
    InvalidToken,
    /// Unexpected failure caught at the engine boundary
    InternalError,
}

impl ErrorKind {
    /// Stable wire name (`"timeout"`, `"no_match"`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingCredentials => "missing_credentials",
            ErrorKind::Disabled => "disabled",
            ErrorKind::NoMatch => "no_match",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidToken => "invalid_token",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error descriptor attached to a result card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardError {
    pub kind: ErrorKind,
    #[serde(default)]
    pub message: String,
}

impl CardError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One song candidate produced by an engine
///
/// Text fields are never null: a missing value is the empty string. Missing fields in
/// deserialized input default to empty strings and zero confidence.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SongMatch {
    pub title: String,
    pub artist: String,
    pub url: String,
    pub preview_url: String,
    pub image_url: String,
    /// Confidence score (0.0-1.0)
    pub confidence: f32,
}

impl SongMatch {
    /// Create new match with clamped confidence (0.0-1.0)
    pub fn new(title: impl Into<String>, artist: impl Into<String>, confidence: f32) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            confidence: clamp_confidence(confidence),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_preview_url(mut self, preview_url: impl Into<String>) -> Self {
        self.preview_url = preview_url.into();
        self
    }

    pub fn with_image_url(mut self, image_url: impl Into<String>) -> Self {
        self.image_url = image_url.into();
        self
    }

    /// Return the same match with its confidence forced into [0, 1]
    ///
    /// Non-finite scores become 0.0.
    pub fn clamped(mut self) -> Self {
        self.confidence = clamp_confidence(self.confidence);
        self
    }
}

fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Uniform output of one engine invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultCard {
    /// Engine name
    pub source: String,
    /// Whether the engine produced a usable result
    pub ok: bool,
    /// Candidates in engine order (possibly empty)
    #[serde(default)]
    pub matches: Vec<SongMatch>,
    /// Present when `ok` is false or the result is degraded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CardError>,
    /// Wall-clock duration of the invocation
    #[serde(default)]
    pub elapsed_seconds: f64,
    /// Engine-specific payload passed through to callers (transcript, features)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl ResultCard {
    /// Successful card (`ok: true`), possibly without matches
    pub fn success(source: impl Into<String>, matches: Vec<SongMatch>, elapsed_seconds: f64) -> Self {
        Self {
            source: source.into(),
            ok: true,
            matches,
            error: None,
            elapsed_seconds,
            raw: None,
        }
    }

    /// Failed card (`ok: false`) with an error descriptor
    pub fn failure(
        source: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        elapsed_seconds: f64,
    ) -> Self {
        Self {
            source: source.into(),
            ok: false,
            matches: Vec::new(),
            error: Some(CardError::new(kind, message)),
            elapsed_seconds,
            raw: None,
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Error kind if the card carries one
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Merged candidate with provenance
///
/// `source` names every engine that reported this song, joined by `+`
/// in the order they were merged (e.g. `"whisper_genius+acoustid"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedMatch {
    #[serde(flatten)]
    pub song: SongMatch,
    pub source: String,
}

impl RankedMatch {
    pub fn new(song: SongMatch, source: impl Into<String>) -> Self {
        Self {
            song,
            source: source.into(),
        }
    }

    /// Individual engine names making up the provenance
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.source.split('+').filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_song_match_confidence_clamping() {
        assert_eq!(SongMatch::new("a", "b", 1.7).confidence, 1.0);
        assert_eq!(SongMatch::new("a", "b", -0.2).confidence, 0.0);
        assert_eq!(SongMatch::new("a", "b", f32::NAN).confidence, 0.0);

        let raw = SongMatch {
            confidence: 4.0,
            ..Default::default()
        };
        assert_eq!(raw.clamped().confidence, 1.0);
    }

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::MissingCredentials).unwrap();
        assert_eq!(json, "\"missing_credentials\"");
        assert_eq!(ErrorKind::Timeout.to_string(), "timeout");
        assert_eq!(ErrorKind::UpstreamError.as_str(), "upstream_error");
    }

    #[test]
    fn test_song_match_missing_fields_default_to_empty() {
        let m: SongMatch = serde_json::from_str(r#"{"title":"Yesterday"}"#).unwrap();
        assert_eq!(m.title, "Yesterday");
        assert_eq!(m.artist, "");
        assert_eq!(m.url, "");
        assert_eq!(m.confidence, 0.0);
    }

    #[test]
    fn test_failure_card_shape() {
        let card = ResultCard::failure("acoustid", ErrorKind::Timeout, "deadline reached", 30.0);
        assert!(!card.ok);
        assert!(card.matches.is_empty());
        assert_eq!(card.error_kind(), Some(ErrorKind::Timeout));

        let json = serde_json::to_value(&card).unwrap();
        assert_eq!(json["error"]["kind"], "timeout");
        assert!(json.get("raw").is_none());
    }

    #[test]
    fn test_ranked_match_flattens_song() {
        let ranked = RankedMatch::new(SongMatch::new("Yesterday", "The Beatles", 0.7), "a+b");
        let json = serde_json::to_value(&ranked).unwrap();
        assert_eq!(json["title"], "Yesterday");
        assert_eq!(json["source"], "a+b");
        assert_eq!(ranked.sources().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
