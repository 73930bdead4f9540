//! Transcript/diarization alignment
//!
//! Assigns each transcript segment the diarization label whose turns
//! overlap it for the greatest total duration. A segment no turn touches
//! keeps no speaker; downstream treats that as an unattributed line, not
//! an error.

use std::collections::BTreeMap;
use tandem_types::{SpeakerInterval, TranscriptSegment};

/// Label every segment from the diarization turns.
///
/// Deterministic: on an exact overlap tie the lexicographically smallest
/// label wins. Zero-duration segments take the label of the turn
/// containing their start point.
pub fn align_transcript(
    segments: &[TranscriptSegment],
    turns: &[SpeakerInterval],
) -> Vec<TranscriptSegment> {
    segments
        .iter()
        .map(|seg| {
            let mut labeled = seg.clone();
            labeled.speaker = label_for(seg, turns);
            labeled
        })
        .collect()
}

fn label_for(seg: &TranscriptSegment, turns: &[SpeakerInterval]) -> Option<String> {
    if seg.end <= seg.start {
        // A point segment falls inside at most a handful of turns; take
        // the smallest label among them for determinism.
        return turns
            .iter()
            .filter(|t| t.contains(seg.start))
            .map(|t| t.label.as_str())
            .min()
            .map(str::to_owned);
    }

    // Sum overlap per label: a speaker interrupted mid-segment still wins
    // if their turns cover more of it in total.
    let mut totals: BTreeMap<&str, f64> = BTreeMap::new();
    for turn in turns {
        let overlap = turn.overlap(seg.start, seg.end);
        if overlap > 0.0 {
            *totals.entry(turn.label.as_str()).or_insert(0.0) += overlap;
        }
    }

    // BTreeMap iteration is label-ordered, so a strict comparison makes
    // the smallest label win ties.
    let mut best: Option<(&str, f64)> = None;
    for (label, total) in &totals {
        if best.map(|(_, t)| *total > t).unwrap_or(true) {
            best = Some((label, *total));
        }
    }
    best.map(|(label, _)| label.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            text: text.to_string(),
            start,
            end,
            speaker: None,
        }
    }

    fn turn(label: &str, start: f64, end: f64) -> SpeakerInterval {
        SpeakerInterval {
            label: label.to_string(),
            start,
            end,
        }
    }

    #[test]
    fn greatest_total_overlap_wins() {
        // A covers 3s of the segment, B covers 1s.
        let segments = vec![seg(0.0, 4.0, "hello there")];
        let turns = vec![turn("SPEAKER_00", 0.0, 3.0), turn("SPEAKER_01", 3.0, 4.0)];

        let out = align_transcript(&segments, &turns);
        assert_eq!(out[0].speaker.as_deref(), Some("SPEAKER_00"));
    }

    #[test]
    fn split_turns_accumulate_per_label() {
        // B holds the single longest turn (1.8s) but A's two turns sum to
        // 2.2s of the segment.
        let segments = vec![seg(0.0, 4.0, "interrupted")];
        let turns = vec![
            turn("SPEAKER_00", 0.0, 1.1),
            turn("SPEAKER_01", 1.1, 2.9),
            turn("SPEAKER_00", 2.9, 4.0),
        ];

        let out = align_transcript(&segments, &turns);
        assert_eq!(out[0].speaker.as_deref(), Some("SPEAKER_00"));
    }

    #[test]
    fn gap_segment_stays_unassigned() {
        let segments = vec![seg(10.0, 12.0, "off mic")];
        let turns = vec![turn("SPEAKER_00", 0.0, 5.0)];

        let out = align_transcript(&segments, &turns);
        assert_eq!(out[0].speaker, None);
        assert_eq!(out[0].text, "off mic");
    }

    #[test]
    fn exact_tie_picks_smallest_label() {
        let segments = vec![seg(0.0, 4.0, "tied")];
        let turns = vec![turn("SPEAKER_01", 2.0, 4.0), turn("SPEAKER_00", 0.0, 2.0)];

        let out = align_transcript(&segments, &turns);
        assert_eq!(out[0].speaker.as_deref(), Some("SPEAKER_00"));
    }

    #[test]
    fn zero_duration_segment_uses_containing_turn() {
        let segments = vec![seg(2.5, 2.5, "uh")];
        let turns = vec![turn("SPEAKER_00", 0.0, 2.0), turn("SPEAKER_01", 2.0, 5.0)];

        let out = align_transcript(&segments, &turns);
        assert_eq!(out[0].speaker.as_deref(), Some("SPEAKER_01"));
    }

    #[test]
    fn zero_duration_segment_outside_all_turns() {
        let segments = vec![seg(9.0, 9.0, "…")];
        let turns = vec![turn("SPEAKER_00", 0.0, 5.0)];

        let out = align_transcript(&segments, &turns);
        assert_eq!(out[0].speaker, None);
    }

    #[test]
    fn two_party_conversation_end_to_end() {
        let segments = vec![
            seg(0.5, 4.0, "so about the roadmap"),
            seg(4.5, 9.5, "right, we should start with the mixer"),
            seg(11.0, 15.0, "agreed, and the gate after that"),
            seg(16.0, 17.5, "sounds good"),
        ];
        let turns = vec![
            turn("SPEAKER_00", 0.0, 10.0),
            turn("SPEAKER_01", 10.0, 18.0),
        ];

        let out = align_transcript(&segments, &turns);
        let labels: Vec<_> = out.iter().map(|s| s.speaker.as_deref()).collect();
        assert_eq!(
            labels,
            vec![
                Some("SPEAKER_00"),
                Some("SPEAKER_00"),
                Some("SPEAKER_01"),
                Some("SPEAKER_01"),
            ]
        );
        // Text and timing pass through untouched.
        assert_eq!(out[1].text, "right, we should start with the mixer");
        assert_eq!(out[1].start, 4.5);
    }

    #[test]
    fn alignment_is_deterministic() {
        let segments = vec![seg(0.0, 6.0, "repeat me")];
        let turns = vec![
            turn("SPEAKER_02", 0.0, 2.0),
            turn("SPEAKER_00", 2.0, 4.0),
            turn("SPEAKER_01", 4.0, 6.0),
        ];

        let first = align_transcript(&segments, &turns);
        for _ in 0..50 {
            assert_eq!(align_transcript(&segments, &turns), first);
        }
        assert_eq!(first[0].speaker.as_deref(), Some("SPEAKER_00"));
    }
}
