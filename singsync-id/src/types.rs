//! Core Types and Trait Definitions for singsync-id
//!
//! Defines the uniform contract every recognition engine implements:
//! - [`SampleHandle`]: read-only reference to the audio being identified
//! - [`EngineDescriptor`]: static per-engine configuration
//! - [`RecognitionEngine`]: the engine trait
//! - [`EngineError`]: engine-internal failures, mapped to an [`ErrorKind`] at the boundary
//!
//! Engines return `Result`; the boundary in [`crate::engines::invoke`] turns every
//! outcome (including panics) into a [`ResultCard`](singsync_common::ResultCard).

use async_trait::async_trait;
use serde::Serialize;
use singsync_common::{CardError, ErrorKind, SongMatch};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ============================================================================
// Sample Handle
// ============================================================================

/// Opaque, cheaply clonable reference to normalized audio
///
/// Immutable for the lifetime of a run. Clones share the same underlying sample, so
/// engines running concurrently only ever read it.
#[derive(Debug, Clone)]
pub struct SampleHandle {
    inner: Arc<SampleSource>,
}

#[derive(Debug)]
enum SampleSource {
    /// Audio on disk. Temporary files are deleted when the last handle is dropped.
    File { path: PathBuf, temporary: bool },
    /// Audio held in memory
    Memory { name: String, bytes: Arc<[u8]> },
}

impl SampleHandle {
    /// Reference an existing file; the file is left in place
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(SampleSource::File {
                path: path.into(),
                temporary: false,
            }),
        }
    }

    /// Take ownership of an uploaded file, deleting it once no handle refers to it
    pub fn temporary_file(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(SampleSource::File {
                path: path.into(),
                temporary: true,
            }),
        }
    }

    /// Wrap in-memory audio; `name` is used as the file name when uploading upstream
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            inner: Arc::new(SampleSource::Memory {
                name: name.into(),
                bytes: Arc::from(bytes),
            }),
        }
    }

    /// Path on disk, if the sample is file-backed
    pub fn path(&self) -> Option<&Path> {
        match self.inner.as_ref() {
            SampleSource::File { path, .. } => Some(path),
            SampleSource::Memory { .. } => None,
        }
    }

    /// File name presented to upstream services
    pub fn file_name(&self) -> String {
        match self.inner.as_ref() {
            SampleSource::File { path, .. } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "sample".to_string()),
            SampleSource::Memory { name, .. } => name.clone(),
        }
    }

    /// File extension (without dot), if the name carries one
    pub fn extension(&self) -> Option<String> {
        let name = self.file_name();
        Path::new(&name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
    }

    /// Read the full sample
    pub async fn read_bytes(&self) -> std::io::Result<Arc<[u8]>> {
        match self.inner.as_ref() {
            SampleSource::File { path, .. } => {
                let bytes = tokio::fs::read(path).await?;
                Ok(Arc::from(bytes))
            }
            SampleSource::Memory { bytes, .. } => Ok(Arc::clone(bytes)),
        }
    }
}

impl Drop for SampleSource {
    fn drop(&mut self) {
        if let SampleSource::File {
            path,
            temporary: true,
        } = self
        {
            match std::fs::remove_file(path.as_path()) {
                Ok(()) => debug!(path = ?path, "Removed temporary sample"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = ?path, error = %e, "Failed to remove temporary sample"),
            }
        }
    }
}

// ============================================================================
// Engine Descriptor
// ============================================================================

/// Static configuration of one engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineDescriptor {
    /// Engine name, unique within a run
    pub name: String,
    pub enabled: bool,
    /// Per-engine cut-off, never later than the run's global deadline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_override: Option<Duration>,
}

impl EngineDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            timeout_override: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn enabled_if(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_override = timeout;
        self
    }
}

// ============================================================================
// Recognition Engine Trait
// ============================================================================

/// Recognition engine contract
///
/// Implementations must:
/// - only read the sample (several engines share it concurrently)
/// - return promptly once `cancel` fires instead of finishing long network calls
/// - report failures through [`EngineError`]; the boundary converts them to cards
///
/// Engines do not enforce their own timeouts. The orchestrator cuts them off.
///
/// # Example
/// ```rust,ignore
/// pub struct EchoEngine;
///
/// #[async_trait::async_trait]
/// impl RecognitionEngine for EchoEngine {
///     fn name(&self) -> &str { "echo" }
///
///     async fn recognize(
///         &self,
///         sample: &SampleHandle,
///         _cancel: &CancellationToken,
///     ) -> Result<EngineOutput, EngineError> {
///         Ok(EngineOutput::matches(vec![SongMatch::new(sample.file_name(), "", 0.1)]))
///     }
/// }
/// ```
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    /// Engine name for provenance tracking
    fn name(&self) -> &str;

    /// Default cut-off for this engine, used when configuration gives none
    fn default_timeout(&self) -> Option<Duration> {
        None
    }

    /// Identify the song in `sample`
    async fn recognize(
        &self,
        sample: &SampleHandle,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput, EngineError>;
}

/// Successful engine output
///
/// `warning` marks a degraded result: the engine ran but part of its work was skipped.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub matches: Vec<SongMatch>,
    pub raw: Option<serde_json::Value>,
    pub warning: Option<CardError>,
}

impl EngineOutput {
    /// Engine ran and found nothing
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn matches(matches: Vec<SongMatch>) -> Self {
        Self {
            matches,
            ..Default::default()
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_warning(mut self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.warning = Some(CardError::new(kind, message));
        self
    }
}

/// Engine-internal failure
#[derive(Debug, Error)]
pub enum EngineError {
    /// Credentials required by the engine are not configured
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    /// Engine switched off
    #[error("Engine disabled: {0}")]
    Disabled(String),

    /// Upstream explicitly reported no match
    #[error("No match: {0}")]
    NoMatch(String),

    /// Network communication error
    #[error("Network error: {0}")]
    Network(String),

    /// Upstream API returned an error status
    #[error("API error: {0}")]
    Api(String),

    /// Failed to parse upstream response or tool output
    #[error("Parse error: {0}")]
    Parse(String),

    /// Sample format not handled by this engine
    #[error("Unsupported input: {0}")]
    UnsupportedInput(String),

    /// Required tool or library not available
    #[error("Not available: {0}")]
    NotAvailable(String),

    /// Engine observed cancellation and stopped
    #[error("Cancelled")]
    Cancelled,

    /// I/O error (file read/write)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal processing error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Error kind reported on the result card
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MissingCredentials(_) => ErrorKind::MissingCredentials,
            EngineError::Disabled(_) => ErrorKind::Disabled,
            EngineError::NoMatch(_) => ErrorKind::NoMatch,
            EngineError::Network(_) | EngineError::Api(_) | EngineError::Parse(_) => {
                ErrorKind::UpstreamError
            }
            EngineError::UnsupportedInput(_)
            | EngineError::NotAvailable(_)
            | EngineError::Cancelled
            | EngineError::Io(_)
            | EngineError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Build an error that maps back to `kind`
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::MissingCredentials => EngineError::MissingCredentials(message),
            ErrorKind::Disabled => EngineError::Disabled(message),
            ErrorKind::NoMatch => EngineError::NoMatch(message),
            ErrorKind::UpstreamError => EngineError::Api(message),
            ErrorKind::Timeout | ErrorKind::InvalidToken | ErrorKind::InternalError => {
                EngineError::Internal(message)
            }
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            EngineError::Parse(e.to_string())
        } else {
            EngineError::Network(e.to_string())
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
