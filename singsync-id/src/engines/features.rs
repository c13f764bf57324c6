//! Local signal-feature engine
//!
//! Decodes the sample with symphonia (any container/codec it supports, M4A/AAC included)
//! and measures signal features. It never produces song matches: the card is `ok: true`
//! with the features in `raw`.
//!
//! # Features
//! - level: duration, RMS, peak, zero-crossing rate
//! - pitch: autocorrelation estimate over the first window, with note name
//! - tempo: energy-flux onset envelope, autocorrelated over the 60-180 BPM lag range
//! - spectrum: mean 12-bin chroma, dominant pitch class, spectral centroid and rolloff
//!
//! Decoding and analysis run on the blocking pool. Cancellation is checked between
//! stages and between decoded packets.

use crate::types::{EngineError, EngineOutput, RecognitionEngine, SampleHandle};
use async_trait::async_trait;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const ENGINE_NAME: &str = "features";

/// Audio beyond this point is not decoded
const MAX_ANALYSIS_SECONDS: u64 = 120;

/// Samples examined by the pitch estimator
const PITCH_WINDOW: usize = 4096;
/// Lowest and highest pitch searched (C2 and C7)
const MIN_PITCH_HZ: f64 = 65.41;
const MAX_PITCH_HZ: f64 = 2093.0;
/// Normalized autocorrelation a lag needs to count as periodic
const PITCH_THRESHOLD: f64 = 0.3;

/// Onset envelope framing
const TEMPO_FRAME: usize = 1024;
const TEMPO_HOP: usize = 512;
const MIN_BPM: f64 = 60.0;
const MAX_BPM: f64 = 180.0;

/// STFT framing for chroma and spectral shape
const SPECTRUM_FRAME: usize = 4096;
/// Fraction of spectral energy below the rolloff frequency
const ROLLOFF_FRACTION: f64 = 0.85;
/// Frames quieter than this (mean magnitude) are skipped
const SILENT_FRAME: f64 = 1e-6;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Decoded mono signal
#[derive(Debug)]
struct MonoSignal {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: usize,
}

/// Measured features, serialized into the card's `raw`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalFeatures {
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: usize,
    pub rms: f64,
    pub peak: f64,
    pub zero_crossing_rate: f64,
    pub pitch: Option<PitchEstimate>,
    pub tempo: Option<TempoEstimate>,
    pub spectrum: Option<SpectralSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PitchEstimate {
    pub hz: f64,
    pub midi: i32,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TempoEstimate {
    pub bpm: f64,
    /// Envelope autocorrelation at the chosen lag relative to lag 0
    pub confidence: f64,
    /// Beats over the analysed duration at `bpm`
    pub beat_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectralSummary {
    /// Mean per-frame chroma, C to B, each frame scaled to a peak of 1
    pub chroma_mean: Vec<f64>,
    pub dominant_pitch_class: String,
    pub centroid_hz: f64,
    pub rolloff_hz: f64,
}

#[derive(Debug, Default)]
pub struct FeatureEngine;

impl FeatureEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RecognitionEngine for FeatureEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    async fn recognize(
        &self,
        sample: &SampleHandle,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        let bytes = sample.read_bytes().await?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let extension = sample.extension();
        let decode_cancel = cancel.clone();
        let signal =
            tokio::task::spawn_blocking(move || decode(bytes, extension.as_deref(), &decode_cancel))
                .await
                .map_err(|e| EngineError::Internal(format!("decode task failed: {}", e)))??;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let features = tokio::task::spawn_blocking(move || analyze(&signal))
            .await
            .map_err(|e| EngineError::Internal(format!("analysis task failed: {}", e)))?;

        debug!(
            engine = ENGINE_NAME,
            duration = features.duration_seconds,
            pitch = ?features.pitch.as_ref().map(|p| p.hz),
            bpm = ?features.tempo.as_ref().map(|t| t.bpm),
            "Features extracted"
        );

        let raw = serde_json::to_value(&features)
            .map_err(|e| EngineError::Internal(format!("serialize features: {}", e)))?;
        Ok(EngineOutput::empty().with_raw(raw))
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode the default audio track to mono f32
fn decode(
    bytes: Arc<[u8]>,
    extension: Option<&str>,
    cancel: &CancellationToken,
) -> Result<MonoSignal, EngineError> {
    let unsupported = |what: &str, e: SymphoniaError| {
        EngineError::UnsupportedInput(format!("{}: {}", what, e))
    };

    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| unsupported("unrecognized audio format", e))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| EngineError::UnsupportedInput("no audio track".into()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| EngineError::UnsupportedInput("unknown sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| unsupported("unsupported codec", e))?;

    let limit = sample_rate as usize * MAX_ANALYSIS_SECONDS as usize;
    let mut samples: Vec<f32> = Vec::new();
    let mut channels = 0;
    let mut buffer: Option<SampleBuffer<f32>> = None;

    while samples.len() < limit {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(unsupported("read packet", e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!(engine = ENGINE_NAME, error = %e, "Skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(unsupported("decode", e)),
        };

        let spec = *decoded.spec();
        channels = spec.channels.count().max(1);
        let needed = decoded.capacity() * channels;
        if buffer.as_ref().is_some_and(|b| b.capacity() < needed) {
            buffer = None;
        }
        let buf =
            buffer.get_or_insert_with(|| SampleBuffer::new(decoded.capacity() as u64, spec));
        buf.copy_interleaved_ref(decoded);

        samples.extend(
            buf.samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
        );
    }
    samples.truncate(limit);

    Ok(MonoSignal {
        samples,
        sample_rate,
        channels,
    })
}

// ============================================================================
// Analysis
// ============================================================================

fn analyze(signal: &MonoSignal) -> SignalFeatures {
    let samples = &signal.samples;
    let n = samples.len();

    let duration_seconds = if signal.sample_rate == 0 {
        0.0
    } else {
        n as f64 / f64::from(signal.sample_rate)
    };

    let (rms, peak, zero_crossing_rate) = if n == 0 {
        (0.0, 0.0, 0.0)
    } else {
        let energy: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        let peak = samples.iter().fold(0.0f64, |acc, &s| acc.max(f64::from(s.abs())));
        let crossings = samples
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();
        (
            (energy / n as f64).sqrt(),
            peak,
            crossings as f64 / n as f64,
        )
    };

    SignalFeatures {
        duration_seconds,
        sample_rate: signal.sample_rate,
        channels: signal.channels,
        rms,
        peak,
        zero_crossing_rate,
        pitch: estimate_pitch(samples, signal.sample_rate),
        tempo: estimate_tempo(samples, signal.sample_rate),
        spectrum: summarize_spectrum(samples, signal.sample_rate),
    }
}

/// Autocorrelation pitch estimate over the first window of the signal
fn estimate_pitch(samples: &[f32], sample_rate: u32) -> Option<PitchEstimate> {
    if sample_rate == 0 {
        return None;
    }
    let rate = f64::from(sample_rate);
    let window = &samples[..samples.len().min(PITCH_WINDOW)];

    let min_lag = ((rate / MAX_PITCH_HZ).floor() as usize).max(1);
    let max_lag = (rate / MIN_PITCH_HZ).ceil() as usize;
    if window.len() <= max_lag {
        return None;
    }

    let energy: f64 = window.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    if energy <= f64::EPSILON {
        return None;
    }

    let mut best_lag = 0;
    let mut best_score = PITCH_THRESHOLD;
    for lag in min_lag..=max_lag {
        let score = autocorrelation(window, lag) / energy;
        if score > best_score {
            best_score = score;
            best_lag = lag;
        }
    }

    if best_lag == 0 {
        return None;
    }
    let hz = rate / best_lag as f64;
    let (midi, note) = hz_to_note(hz);
    Some(PitchEstimate { hz, midi, note })
}

/// Tempo from the periodicity of the energy-flux onset envelope
///
/// Needs at least two periods of the slowest tempo; shorter clips give `None`.
fn estimate_tempo(samples: &[f32], sample_rate: u32) -> Option<TempoEstimate> {
    if sample_rate == 0 || samples.len() < TEMPO_FRAME {
        return None;
    }
    let frames_per_minute = 60.0 * f64::from(sample_rate) / TEMPO_HOP as f64;
    let min_lag = (frames_per_minute / MAX_BPM).ceil().max(1.0) as usize;
    let max_lag = (frames_per_minute / MIN_BPM).floor() as usize;

    let envelope = onset_envelope(samples);
    if envelope.len() < 2 * max_lag || min_lag > max_lag {
        return None;
    }

    let mean = envelope.iter().sum::<f64>() / envelope.len() as f64;
    let centered: Vec<f64> = envelope.iter().map(|e| e - mean).collect();
    let zero_lag: f64 = centered.iter().map(|e| e * e).sum();
    if zero_lag <= f64::EPSILON {
        return None;
    }

    // Strict `>` keeps the shortest lag among equals (faster tempo)
    let mut best: Option<(usize, f64)> = None;
    for lag in min_lag..=max_lag {
        let score: f64 = centered.iter().zip(&centered[lag..]).map(|(a, b)| a * b).sum();
        if score > best.map(|(_, s)| s).unwrap_or(0.0) {
            best = Some((lag, score));
        }
    }

    let (lag, score) = best?;
    let bpm = frames_per_minute / lag as f64;
    let duration = samples.len() as f64 / f64::from(sample_rate);
    Some(TempoEstimate {
        bpm,
        confidence: (score / zero_lag).clamp(0.0, 1.0),
        beat_count: (duration * bpm / 60.0).floor() as u32,
    })
}

/// Positive frame-to-frame RMS increase, one value per hop
fn onset_envelope(samples: &[f32]) -> Vec<f64> {
    let energies: Vec<f64> = samples
        .windows(TEMPO_FRAME)
        .step_by(TEMPO_HOP)
        .map(|frame| {
            let sum_sq: f64 = frame.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
            (sum_sq / TEMPO_FRAME as f64).sqrt()
        })
        .collect();

    energies
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).max(0.0))
        .collect()
}

/// Chroma and spectral shape averaged over non-silent STFT frames
fn summarize_spectrum(samples: &[f32], sample_rate: u32) -> Option<SpectralSummary> {
    if sample_rate == 0 || samples.len() < SPECTRUM_FRAME {
        return None;
    }
    let rate = f64::from(sample_rate);
    let bin_hz = rate / SPECTRUM_FRAME as f64;
    let bins = SPECTRUM_FRAME / 2;

    let window: Vec<f32> = (0..SPECTRUM_FRAME)
        .map(|i| {
            let phase = 2.0 * std::f32::consts::PI * i as f32 / (SPECTRUM_FRAME - 1) as f32;
            0.5 - 0.5 * phase.cos()
        })
        .collect();
    // Pitch class of every bin inside the musical range
    let pitch_classes: Vec<Option<usize>> = (0..bins)
        .map(|k| {
            let hz = k as f64 * bin_hz;
            (MIN_PITCH_HZ..=MAX_PITCH_HZ)
                .contains(&hz)
                .then(|| hz_to_note(hz).0.rem_euclid(12) as usize)
        })
        .collect();

    let fft = FftPlanner::<f32>::new().plan_fft_forward(SPECTRUM_FRAME);
    let mut buffer = vec![Complex::new(0.0f32, 0.0); SPECTRUM_FRAME];
    let mut magnitudes = vec![0.0f64; bins];

    let mut chroma_sum = [0.0f64; 12];
    let (mut centroid_sum, mut rolloff_sum) = (0.0, 0.0);
    let mut frames = 0usize;

    for frame in samples.chunks_exact(SPECTRUM_FRAME) {
        for ((slot, &s), &w) in buffer.iter_mut().zip(frame).zip(&window) {
            *slot = Complex::new(s * w, 0.0);
        }
        fft.process(&mut buffer);
        for (mag, c) in magnitudes.iter_mut().zip(&buffer) {
            *mag = f64::from(c.norm());
        }

        let total: f64 = magnitudes.iter().sum();
        if total / bins as f64 <= SILENT_FRAME {
            continue;
        }

        let mut chroma = [0.0f64; 12];
        for (mag, pc) in magnitudes.iter().zip(&pitch_classes) {
            if let Some(pc) = pc {
                chroma[*pc] += mag;
            }
        }
        let chroma_peak = chroma.iter().cloned().fold(0.0, f64::max);
        if chroma_peak > 0.0 {
            for (sum, value) in chroma_sum.iter_mut().zip(chroma) {
                *sum += value / chroma_peak;
            }
        }

        centroid_sum += magnitudes
            .iter()
            .enumerate()
            .map(|(k, mag)| k as f64 * bin_hz * mag)
            .sum::<f64>()
            / total;

        let energy_total: f64 = magnitudes.iter().map(|m| m * m).sum();
        let mut cumulative = 0.0;
        let rolloff_bin = magnitudes
            .iter()
            .position(|m| {
                cumulative += m * m;
                cumulative >= ROLLOFF_FRACTION * energy_total
            })
            .unwrap_or(bins - 1);
        rolloff_sum += rolloff_bin as f64 * bin_hz;

        frames += 1;
    }

    if frames == 0 {
        return None;
    }

    let chroma_mean: Vec<f64> = chroma_sum.iter().map(|s| s / frames as f64).collect();
    let dominant = chroma_mean
        .iter()
        .enumerate()
        .fold((0, f64::MIN), |best, (pc, &v)| if v > best.1 { (pc, v) } else { best })
        .0;

    Some(SpectralSummary {
        chroma_mean,
        dominant_pitch_class: NOTE_NAMES[dominant].to_string(),
        centroid_hz: centroid_sum / frames as f64,
        rolloff_hz: rolloff_sum / frames as f64,
    })
}

fn autocorrelation(window: &[f32], lag: usize) -> f64 {
    window
        .iter()
        .zip(&window[lag..])
        .map(|(&a, &b)| f64::from(a) * f64::from(b))
        .sum()
}

/// MIDI note number and name (A4 = 440 Hz = MIDI 69)
pub fn hz_to_note(hz: f64) -> (i32, String) {
    let midi = (69.0 + 12.0 * (hz / 440.0).log2()).round() as i32;
    let name = NOTE_NAMES[midi.rem_euclid(12) as usize];
    let octave = midi.div_euclid(12) - 1;
    (midi, format!("{}{}", name, octave))
}
