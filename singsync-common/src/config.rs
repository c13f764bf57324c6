//! Configuration loading
//!
//! Settings resolve with priority: command line → environment → TOML file → built-in
//! defaults. The TOML file is optional; when the default location has no file the
//! built-in defaults apply.
//!
//! ```toml
//! port = 8000
//! global_timeout_secs = 30
//! merge_priority = ["whisper_genius", "acoustid", "features"]
//!
//! [engines.acoustid]
//! enabled = true
//! api_key = "..."
//!
//! [engines.features]
//! enabled = true
//! timeout_secs = 10
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Bootstrap configuration for the identification service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Interface the HTTP server binds to
    pub bind_address: String,
    /// HTTP server port
    pub port: u16,
    /// Directory where uploaded samples are written
    pub upload_dir: PathBuf,
    /// Deadline shared by all engines of one run
    pub global_timeout_secs: u64,
    /// Submitted samples not used by a run are dropped after this long
    pub sample_ttl_secs: u64,
    /// Engine order used when merging matches
    pub merge_priority: Vec<String>,
    pub logging: LoggingConfig,
    pub engines: EnginesConfig,
    pub genius: GeniusConfig,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8000,
            upload_dir: std::env::temp_dir().join("singsync").join("uploads"),
            global_timeout_secs: 30,
            sample_ttl_secs: 600,
            merge_priority: vec![
                "whisper_genius".to_string(),
                "acoustid".to_string(),
                "features".to_string(),
            ],
            logging: LoggingConfig::default(),
            engines: EnginesConfig::default(),
            genius: GeniusConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Per-engine sections
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginesConfig {
    pub acoustid: AcoustIdConfig,
    pub whisper_genius: WhisperGeniusConfig,
    pub features: FeaturesConfig,
}

/// Fingerprint engine: Chromaprint `fpcalc` + AcoustID lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcoustIdConfig {
    pub enabled: bool,
    pub timeout_secs: Option<u64>,
    pub api_key: Option<String>,
    pub endpoint: String,
    /// Chromaprint command line tool
    pub fpcalc_bin: String,
}

impl Default for AcoustIdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: None,
            api_key: None,
            endpoint: "https://api.acoustid.org/v2/lookup".to_string(),
            fpcalc_bin: "fpcalc".to_string(),
        }
    }
}

/// Transcribe-then-lyrics-search engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperGeniusConfig {
    pub enabled: bool,
    pub timeout_secs: Option<u64>,
    pub openai_api_key: Option<String>,
    pub transcription_endpoint: String,
    pub model: String,
    /// Spoken language hint; `None` lets the service detect it
    pub language: Option<String>,
}

impl Default for WhisperGeniusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: None,
            openai_api_key: None,
            transcription_endpoint: "https://api.openai.com/v1/audio/transcriptions".to_string(),
            model: "whisper-1".to_string(),
            language: None,
        }
    }
}

/// Local signal-feature engine
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub enabled: bool,
    pub timeout_secs: Option<u64>,
}

/// Lyrics search (used by `whisper_genius` and text search)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeniusConfig {
    pub api_token: Option<String>,
    pub endpoint: String,
    pub max_results: usize,
}

impl Default for GeniusConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            endpoint: "https://api.genius.com/search".to_string(),
            max_results: 5,
        }
    }
}

impl TomlConfig {
    /// Load configuration
    ///
    /// An explicit `path` must exist. Without one, the default location is tried and
    /// silently skipped when absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => load_toml_config(path),
            None => match default_config_path() {
                Some(path) if path.exists() => load_toml_config(&path),
                _ => {
                    debug!("No config file found, using built-in defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    /// Apply overrides from process environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    ///
    /// Recognized variables:
    /// `ENABLE_ACOUSTID`, `ENABLE_WHISPER_GENIUS`, `ENABLE_FEATURES` ("1" / "0"),
    /// `SINGSYNC_TIMEOUT_SEC` (or `SSE_TIMEOUT_SEC`), `SINGSYNC_UPLOAD_DIR`,
    /// `ACOUSTID_API_KEY`, `OPENAI_API_KEY`, `GENIUS_API_TOKEN`, `FPCALC_BIN`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |names: &[&str]| first_non_empty(&lookup, names);

        if let Some(v) = get(&["ENABLE_ACOUSTID"]) {
            self.engines.acoustid.enabled = parse_flag(&v);
        }
        if let Some(v) = get(&["ENABLE_WHISPER_GENIUS"]) {
            self.engines.whisper_genius.enabled = parse_flag(&v);
        }
        if let Some(v) = get(&["ENABLE_FEATURES", "ENABLE_CUSTOM"]) {
            self.engines.features.enabled = parse_flag(&v);
        }

        if let Some(v) = get(&["SINGSYNC_TIMEOUT_SEC", "SSE_TIMEOUT_SEC"]) {
            match v.parse::<u64>() {
                Ok(secs) if secs > 0 => self.global_timeout_secs = secs,
                _ => warn!("Ignoring invalid global timeout '{}'", v),
            }
        }

        if let Some(v) = get(&["SINGSYNC_UPLOAD_DIR"]) {
            self.upload_dir = PathBuf::from(v);
        }

        if let Some(key) = get(&["ACOUSTID_API_KEY"]) {
            if self.engines.acoustid.api_key.is_some() {
                warn!("AcoustID API key found in environment and TOML. Using environment.");
            }
            info!("AcoustID API key loaded from environment variable");
            self.engines.acoustid.api_key = Some(key);
        }
        if let Some(key) = get(&["OPENAI_API_KEY"]) {
            info!("OpenAI API key loaded from environment variable");
            self.engines.whisper_genius.openai_api_key = Some(key);
        }
        if let Some(token) = get(&["GENIUS_API_TOKEN"]) {
            info!("Genius API token loaded from environment variable");
            self.genius.api_token = Some(token);
        }
        if let Some(bin) = get(&["FPCALC_BIN"]) {
            self.engines.acoustid.fpcalc_bin = bin;
        }
    }
}

/// Read and parse a TOML configuration file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;
    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;
    info!("Configuration loaded from {}", path.display());
    Ok(config)
}

/// Default configuration file location (`<config dir>/singsync/singsync.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("singsync").join("singsync.toml"))
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Mask a secret for logging: `abc…xyz`, `***` for short values, `<none>` when unset
pub fn mask_secret(value: Option<&str>) -> String {
    match value {
        None => "<none>".to_string(),
        Some(v) if v.is_empty() => "<none>".to_string(),
        Some(v) if v.chars().count() <= 6 => "***".to_string(),
        Some(v) => {
            let chars: Vec<char> = v.chars().collect();
            let head: String = chars[..3].iter().collect();
            let tail: String = chars[chars.len() - 3..].iter().collect();
            format!("{}…{}", head, tail)
        }
    }
}

fn first_non_empty<F>(lookup: &F, names: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    names
        .iter()
        .filter_map(|name| lookup(name))
        .map(|v| v.trim().to_string())
        .find(|v| is_valid_key(v))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
