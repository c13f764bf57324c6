//! Recognition engines
//!
//! Each engine implements [`RecognitionEngine`]. The [`EngineRegistry`] holds the
//! configured set in deterministic order and selects the engines for a run.
//!
//! # Engines
//! 1. **whisper_genius** - transcribe the sample, search the transcript as lyrics
//! 2. **acoustid** - Chromaprint fingerprint + AcoustID lookup
//! 3. **features** - local signal features (no song matches)
//! 4. **mock** - scripted engine for tests and local development
//!
//! # Boundary
//! [`invoke`] is the only way the orchestrator calls an engine. It never fails:
//! errors and panics become `ok: false` cards and confidences are clamped to [0, 1].

pub mod acoustid;
pub mod features;
pub mod genius;
pub mod mock;
pub mod whisper_genius;

use crate::error::IdentifyError;
use crate::types::{EngineDescriptor, EngineError, RecognitionEngine, SampleHandle};
use futures::FutureExt;
use singsync_common::config::TomlConfig;
use singsync_common::{ErrorKind, ResultCard};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run one engine and convert whatever happens into a result card
///
/// Elapsed time covers the whole invocation. Match confidences are clamped here so
/// downstream consumers can rely on the [0, 1] range.
pub async fn invoke(
    engine: &dyn RecognitionEngine,
    sample: &SampleHandle,
    cancel: &CancellationToken,
) -> ResultCard {
    let name = engine.name().to_string();
    let started = Instant::now();

    let outcome = AssertUnwindSafe(engine.recognize(sample, cancel))
        .catch_unwind()
        .await;
    let elapsed = started.elapsed().as_secs_f64();

    match outcome {
        Ok(Ok(output)) => {
            debug!(
                engine = %name,
                matches = output.matches.len(),
                elapsed_ms = (elapsed * 1000.0) as u64,
                "Engine finished"
            );
            let matches = output.matches.into_iter().map(|m| m.clamped()).collect();
            let mut card = ResultCard::success(name, matches, elapsed);
            card.error = output.warning;
            card.raw = output.raw;
            card
        }
        Ok(Err(e)) => {
            warn!(engine = %name, error = %e, "Engine failed");
            ResultCard::failure(name, e.kind(), e.to_string(), elapsed)
        }
        Err(panic) => {
            let message = panic_message(&*panic);
            warn!(engine = %name, panic = %message, "Engine panicked");
            ResultCard::failure(
                name,
                ErrorKind::InternalError,
                format!("engine panicked: {}", message),
                elapsed,
            )
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Engine Registry
// ============================================================================

/// Engine plus its static descriptor
#[derive(Clone)]
pub struct RegisteredEngine {
    pub descriptor: EngineDescriptor,
    pub engine: Arc<dyn RecognitionEngine>,
}

impl RegisteredEngine {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Configured engines in registration order
#[derive(Clone, Default)]
pub struct EngineRegistry {
    entries: Vec<RegisteredEngine>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine under its own name
    ///
    /// The descriptor timeout falls back to the engine's default timeout. A later
    /// registration with the same name replaces the earlier one in place.
    pub fn register(&mut self, engine: Arc<dyn RecognitionEngine>, enabled: bool) -> &mut Self {
        let descriptor = EngineDescriptor {
            name: engine.name().to_string(),
            enabled,
            timeout_override: engine.default_timeout(),
        };
        self.register_with(descriptor, engine)
    }

    /// Register an engine with an explicit descriptor
    pub fn register_with(
        &mut self,
        descriptor: EngineDescriptor,
        engine: Arc<dyn RecognitionEngine>,
    ) -> &mut Self {
        let entry = RegisteredEngine { descriptor, engine };
        match self.entries.iter_mut().find(|e| e.name() == entry.name()) {
            Some(existing) => {
                warn!(engine = %entry.name(), "Replacing already registered engine");
                *existing = entry;
            }
            None => self.entries.push(entry),
        }
        self
    }

    /// Build the production engine set from configuration
    ///
    /// Every known engine is registered; the `enabled` flags come from configuration.
    /// `lyrics` is the search backend shared with text search.
    pub fn from_config(
        config: &TomlConfig,
        lyrics: Arc<dyn genius::LyricsSearch>,
    ) -> Result<Self, EngineError> {
        let engines = &config.engines;

        let mut registry = Self::new();
        registry.register_with(
            EngineDescriptor::new(whisper_genius::ENGINE_NAME)
                .with_timeout(engines.whisper_genius.timeout_secs.map(Duration::from_secs))
                .enabled_if(engines.whisper_genius.enabled),
            Arc::new(whisper_genius::WhisperGeniusEngine::from_config(
                &engines.whisper_genius,
                lyrics,
            )?),
        );
        registry.register_with(
            EngineDescriptor::new(acoustid::ENGINE_NAME)
                .with_timeout(engines.acoustid.timeout_secs.map(Duration::from_secs))
                .enabled_if(engines.acoustid.enabled),
            Arc::new(acoustid::AcoustIdEngine::from_config(&engines.acoustid)?),
        );
        registry.register_with(
            EngineDescriptor::new(features::ENGINE_NAME)
                .with_timeout(engines.features.timeout_secs.map(Duration::from_secs))
                .enabled_if(engines.features.enabled),
            Arc::new(features::FeatureEngine::new()),
        );

        for entry in &registry.entries {
            info!(
                engine = %entry.name(),
                enabled = entry.descriptor.enabled,
                timeout = ?entry.descriptor.timeout_override,
                "Engine registered"
            );
        }

        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredEngine> {
        self.entries.iter().find(|e| e.name() == name)
    }

    pub fn descriptors(&self) -> Vec<EngineDescriptor> {
        self.entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &RegisteredEngine> {
        self.entries.iter().filter(|e| e.descriptor.enabled)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Engines to launch for one run, in registry order
    ///
    /// Without `requested`, every enabled engine runs. With it, the run uses the
    /// requested engines that are enabled; requested names that are disabled are
    /// skipped.
    ///
    /// # Errors
    /// - `UnknownEngine` if a requested name is not registered
    /// - `NoEnginesEnabled` if the selection is empty
    pub fn select(&self, requested: Option<&[String]>) -> Result<Vec<RegisteredEngine>, IdentifyError> {
        let selected: Vec<RegisteredEngine> = match requested {
            None => self.enabled().cloned().collect(),
            Some(names) => {
                if let Some(unknown) = names.iter().find(|n| self.get(n).is_none()) {
                    return Err(IdentifyError::UnknownEngine(unknown.clone()));
                }
                self.entries
                    .iter()
                    .filter(|e| names.iter().any(|n| n == e.name()))
                    .filter(|e| {
                        if !e.descriptor.enabled {
                            debug!(engine = %e.name(), "Requested engine is disabled, skipping");
                        }
                        e.descriptor.enabled
                    })
                    .cloned()
                    .collect()
            }
        };

        if selected.is_empty() {
            return Err(IdentifyError::NoEnginesEnabled);
        }
        Ok(selected)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::mock::{MockBehavior, MockEngine};
    use super::*;
    use singsync_common::SongMatch;

    fn sample() -> SampleHandle {
        SampleHandle::from_bytes("clip.wav", vec![0u8; 4])
    }

    #[tokio::test]
    async fn test_invoke_success_clamps_confidence() {
        let engine = MockEngine::new("mock").returning(vec![SongMatch {
            title: "Loud".into(),
            confidence: 3.5,
            ..Default::default()
        }]);

        let card = invoke(&engine, &sample(), &CancellationToken::new()).await;

        assert!(card.ok);
        assert_eq!(card.source, "mock");
        assert_eq!(card.matches[0].confidence, 1.0);
        assert!(card.error.is_none());
    }

    #[tokio::test]
    async fn test_invoke_converts_error() {
        let engine = MockEngine::new("mock").failing(ErrorKind::MissingCredentials);

        let card = invoke(&engine, &sample(), &CancellationToken::new()).await;

        assert!(!card.ok);
        assert_eq!(card.error_kind(), Some(ErrorKind::MissingCredentials));
    }

    #[tokio::test]
    async fn test_invoke_catches_panic() {
        let engine = MockEngine::new("boom").with_behavior(MockBehavior::Panic);

        let card = invoke(&engine, &sample(), &CancellationToken::new()).await;

        assert!(!card.ok);
        assert_eq!(card.error_kind(), Some(ErrorKind::InternalError));
        assert!(card.error.unwrap().message.contains("panicked"));
    }

    fn registry() -> EngineRegistry {
        let mut registry = EngineRegistry::new();
        registry
            .register(Arc::new(MockEngine::new("a")), true)
            .register(Arc::new(MockEngine::new("b")), false)
            .register(Arc::new(MockEngine::new("c")), true);
        registry
    }

    #[test]
    fn test_select_all_enabled_in_order() {
        let selected = registry().select(None).unwrap();
        let names: Vec<&str> = selected.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn test_select_requested_subset() {
        let requested = vec!["c".to_string(), "b".to_string()];
        let selected = registry().select(Some(&requested)).unwrap();
        let names: Vec<&str> = selected.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["c"], "Disabled engines are skipped");
    }

    #[test]
    fn test_select_unknown_engine() {
        let requested = vec!["zzz".to_string()];
        let err = registry().select(Some(&requested)).err().unwrap();
        assert!(matches!(err, IdentifyError::UnknownEngine(name) if name == "zzz"));
    }

    #[test]
    fn test_select_nothing_enabled() {
        let requested = vec!["b".to_string()];
        let err = registry().select(Some(&requested)).err().unwrap();
        assert!(matches!(err, IdentifyError::NoEnginesEnabled));

        let err = EngineRegistry::new().select(None).err().unwrap();
        assert!(matches!(err, IdentifyError::NoEnginesEnabled));
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = registry();
        registry.register(Arc::new(MockEngine::new("b")), true);
        assert_eq!(registry.len(), 3);
        assert!(registry.get("b").unwrap().descriptor.enabled);
    }

    #[test]
    fn test_from_config_registers_all_engines() {
        let mut config = TomlConfig::default();
        config.engines.features.enabled = true;
        config.engines.acoustid.enabled = false;
        config.engines.features.timeout_secs = Some(3);

        let lyrics: Arc<dyn genius::LyricsSearch> =
            Arc::new(genius::GeniusClient::from_config(&config.genius).unwrap());
        let registry = EngineRegistry::from_config(&config, Arc::clone(&lyrics)).unwrap();
        let descriptors = registry.descriptors();

        let names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["whisper_genius", "acoustid", "features"]);
        assert!(!registry.get("acoustid").unwrap().descriptor.enabled);
        assert_eq!(
            registry.get("features").unwrap().descriptor.timeout_override,
            Some(Duration::from_secs(3))
        );
        // Registry holds the only other reference to the shared backend
        assert_eq!(Arc::strong_count(&lyrics), 2);
    }
}
