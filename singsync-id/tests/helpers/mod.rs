//! Shared fixtures for singsync-id integration tests
//!
//! Not every test binary uses every helper.
#![allow(dead_code)]

use singsync_common::SongMatch;
use singsync_id::delivery::IdentifyService;
use singsync_id::engines::mock::MockEngine;
use singsync_id::engines::{EngineRegistry, RegisteredEngine};
use singsync_id::merger::ResultMerger;
use singsync_id::orchestrator::Orchestrator;
use singsync_id::store::SampleStore;
use singsync_id::types::{EngineDescriptor, RecognitionEngine, SampleHandle};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

/// Mono 16-bit WAV of a sine tone
pub fn sine_wav(freq: f32, seconds: f32, sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let total = (seconds * sample_rate as f32) as usize;
        for i in 0..total {
            let t = i as f32 / sample_rate as f32;
            let v = (t * freq * 2.0 * std::f32::consts::PI).sin() * 0.5;
            writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

pub fn sample() -> SampleHandle {
    SampleHandle::from_bytes("clip.wav", sine_wav(440.0, 0.25, 8_000))
}

pub fn song(title: &str, artist: &str, confidence: f32) -> SongMatch {
    SongMatch::new(title, artist, confidence)
}

/// Registered, enabled mock
pub fn entry(engine: MockEngine) -> RegisteredEngine {
    RegisteredEngine {
        descriptor: EngineDescriptor::new(engine.name()),
        engine: Arc::new(engine),
    }
}

/// Registered mock with its own engine timeout
pub fn entry_with_timeout(engine: MockEngine, timeout: Duration) -> RegisteredEngine {
    RegisteredEngine {
        descriptor: EngineDescriptor::new(engine.name()).with_timeout(Some(timeout)),
        engine: Arc::new(engine),
    }
}

pub fn registry(engines: Vec<MockEngine>) -> EngineRegistry {
    let mut registry = EngineRegistry::new();
    for engine in engines {
        registry.register(Arc::new(engine), true);
    }
    registry
}

/// Service over mock engines, no lyrics backend
pub fn service(engines: Vec<MockEngine>, global_timeout: Duration) -> IdentifyService {
    IdentifyService::new(
        SampleStore::new(),
        registry(engines),
        Orchestrator::new(global_timeout),
        ResultMerger::new(vec!["a".into(), "b".into(), "c".into()]),
        None,
    )
}
