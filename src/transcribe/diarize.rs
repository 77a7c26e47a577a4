//! Speaker attribution merged onto already-assembled segments.
//!
//! The diarizer itself is a seam: it turns normalized audio into labelled
//! speaker turns. Merging is pure and only ever decides which speaker a
//! segment belongs to; segment text and timing are never touched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Presentation colors handed out to speakers in order of first appearance
pub const SPEAKER_PALETTE: [&str; 8] = [
    "#4E79A7", "#F28E2B", "#E15759", "#76B7B2", "#59A14F", "#EDC948", "#B07AA1", "#FF9DA7",
];

/// One labelled interval produced by a diarizer, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerTurn {
    /// Stable label, e.g. "SPEAKER_00"
    pub label: String,
    pub start: f64,
    pub end: f64,
}

impl SpeakerTurn {
    pub fn new(label: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            label: label.into(),
            start,
            end,
        }
    }

    /// Length of the intersection with the half-open range `[start, end)`
    pub fn overlap(&self, start: f64, end: f64) -> f64 {
        (self.end.min(end) - self.start.max(start)).max(0.0)
    }
}

#[derive(Error, Debug)]
pub enum DiarizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Diarization model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("Diarization failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait SpeakerDiarizer: Send + Sync {
    async fn diarize(&self, audio_path: &Path) -> Result<Vec<SpeakerTurn>, DiarizeError>;
}

/// The turn a segment `[start, end)` belongs to: greatest overlap wins, equal
/// overlaps go to the turn that starts first. `None` if nothing overlaps.
pub fn best_turn<'a>(start: f64, end: f64, turns: &'a [SpeakerTurn]) -> Option<&'a SpeakerTurn> {
    let mut best: Option<(&SpeakerTurn, f64)> = None;

    for turn in turns {
        let overlap = turn.overlap(start, end);
        if overlap <= 0.0 {
            continue;
        }
        best = match best {
            Some((current, current_overlap))
                if current_overlap > overlap
                    || (current_overlap == overlap && current.start <= turn.start) =>
            {
                Some((current, current_overlap))
            }
            _ => Some((turn, overlap)),
        };
    }

    best.map(|(turn, _)| turn)
}

/// Speaker label per segment, in input order
pub fn assign_speakers<'a>(segments: &[(f64, f64)], turns: &'a [SpeakerTurn]) -> Vec<Option<&'a str>> {
    segments
        .iter()
        .map(|&(start, end)| best_turn(start, end, turns).map(|t| t.label.as_str()))
        .collect()
}

/// Display name and color for each distinct label, numbered in order of the
/// label's earliest turn.
pub fn speaker_styles(turns: &[SpeakerTurn]) -> HashMap<String, (String, &'static str)> {
    let mut ordered: Vec<&SpeakerTurn> = turns.iter().collect();
    ordered.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut styles = HashMap::new();
    for turn in ordered {
        if styles.contains_key(&turn.label) {
            continue;
        }
        let ordinal = styles.len();
        styles.insert(
            turn.label.clone(),
            (
                format!("Speaker {}", ordinal + 1),
                SPEAKER_PALETTE[ordinal % SPEAKER_PALETTE.len()],
            ),
        );
    }
    styles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greatest_overlap_wins() {
        let turns = vec![
            SpeakerTurn::new("SPEAKER_00", 0.0, 3.0),
            SpeakerTurn::new("SPEAKER_01", 3.0, 10.0),
        ];
        let labels = assign_speakers(&[(0.0, 5.0), (5.0, 10.0)], &turns);
        assert_eq!(labels, vec![Some("SPEAKER_00"), Some("SPEAKER_01")]);
    }

    #[test]
    fn test_tie_goes_to_earliest_turn() {
        let turns = vec![
            SpeakerTurn::new("SPEAKER_01", 2.0, 4.0),
            SpeakerTurn::new("SPEAKER_00", 0.0, 2.0),
        ];
        assert_eq!(best_turn(0.0, 4.0, &turns).unwrap().label, "SPEAKER_00");
    }

    #[test]
    fn test_touching_ranges_do_not_overlap() {
        let turns = vec![SpeakerTurn::new("SPEAKER_00", 5.0, 8.0)];
        assert!(best_turn(0.0, 5.0, &turns).is_none());
        assert!(best_turn(8.0, 9.0, &turns).is_none());
        assert!(best_turn(4.9, 5.1, &turns).is_some());
    }

    #[test]
    fn test_styles_follow_first_appearance() {
        let turns = vec![
            SpeakerTurn::new("SPEAKER_07", 4.0, 5.0),
            SpeakerTurn::new("SPEAKER_03", 0.0, 1.0),
            SpeakerTurn::new("SPEAKER_07", 6.0, 7.0),
        ];
        let styles = speaker_styles(&turns);
        assert_eq!(styles.len(), 2);
        assert_eq!(styles["SPEAKER_03"], ("Speaker 1".to_string(), SPEAKER_PALETTE[0]));
        assert_eq!(styles["SPEAKER_07"], ("Speaker 2".to_string(), SPEAKER_PALETTE[1]));
    }
}
