//! Result merger
//!
//! Combines the cards of one run into a single ranked, deduplicated list.
//!
//! Engines are processed in priority order. Two matches are the same song when their
//! normalized titles are equal and, if both carry an artist, their normalized artists are
//! equal too. Normalization is trim + lowercase; there is no fuzzy matching.
//!
//! A duplicate keeps its original position, takes the higher confidence, gains the new
//! source in its provenance (`"a+b"`), and fills its empty URL fields. The final list is
//! stably sorted by confidence, highest first.

use singsync_common::{RankedMatch, ResultCard, SongMatch};
use tracing::debug;

/// Default engine priority: lyric engines, then fingerprints, then feature-only engines
pub const DEFAULT_PRIORITY: [&str; 3] = ["whisper_genius", "acoustid", "features"];

#[derive(Debug, Clone)]
pub struct ResultMerger {
    priority: Vec<String>,
}

impl Default for ResultMerger {
    fn default() -> Self {
        Self::new(DEFAULT_PRIORITY.iter().map(|s| s.to_string()).collect())
    }
}

impl ResultMerger {
    pub fn new(priority: Vec<String>) -> Self {
        Self { priority }
    }

    pub fn priority(&self) -> &[String] {
        &self.priority
    }

    /// Merge every card's matches into one ranked list
    ///
    /// Cards from engines missing from the priority list are processed after the listed
    /// ones, in card order. Failed cards carry no matches and contribute nothing.
    pub fn merge(&self, cards: &[ResultCard]) -> Vec<RankedMatch> {
        let mut ordered: Vec<&ResultCard> = Vec::with_capacity(cards.len());
        for name in &self.priority {
            ordered.extend(cards.iter().filter(|c| &c.source == name));
        }
        ordered.extend(
            cards
                .iter()
                .filter(|c| !self.priority.iter().any(|p| p == &c.source)),
        );

        let mut accumulator: Vec<RankedMatch> = Vec::new();
        for card in ordered {
            for song in &card.matches {
                absorb(&mut accumulator, song, &card.source);
            }
        }

        // Stable: equal confidences keep insertion order
        accumulator.sort_by(|a, b| sort_key(b).total_cmp(&sort_key(a)));

        debug!(
            cards = cards.len(),
            merged = accumulator.len(),
            "Merged result cards"
        );
        accumulator
    }
}

fn absorb(accumulator: &mut Vec<RankedMatch>, song: &SongMatch, source: &str) {
    match accumulator.iter_mut().find(|existing| same_song(&existing.song, song)) {
        Some(existing) => {
            if song.confidence > existing.song.confidence {
                existing.song.confidence = song.confidence;
            }
            if !existing.sources().any(|s| s == source) {
                existing.source.push('+');
                existing.source.push_str(source);
            }
            fill_if_empty(&mut existing.song.url, &song.url);
            fill_if_empty(&mut existing.song.preview_url, &song.preview_url);
            fill_if_empty(&mut existing.song.image_url, &song.image_url);
        }
        None => accumulator.push(RankedMatch::new(song.clone(), source)),
    }
}

fn fill_if_empty(target: &mut String, candidate: &str) {
    if target.is_empty() && !candidate.is_empty() {
        *target = candidate.to_string();
    }
}

/// Lowercase and trim
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Same title, and same artist when both sides name one
pub fn same_song(a: &SongMatch, b: &SongMatch) -> bool {
    if normalize(&a.title) != normalize(&b.title) {
        return false;
    }
    let (artist_a, artist_b) = (normalize(&a.artist), normalize(&b.artist));
    artist_a.is_empty() || artist_b.is_empty() || artist_a == artist_b
}

fn sort_key(m: &RankedMatch) -> f32 {
    if m.song.confidence.is_nan() {
        0.0
    } else {
        m.song.confidence
    }
}
