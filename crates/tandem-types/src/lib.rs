//! Shared types for Tandem
//!
//! This crate contains the data model shared across the Tandem core:
//! audio chunks, transcript segments, diarization intervals, speaker
//! records, session state, and the sidecar wire protocol.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod error;
pub mod protocol;

pub use error::{Error, Result};

// ============================================================================
// Audio Types
// ============================================================================

/// Whether a chunk was classified as speech or silence by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Speech,
    Silence,
}

/// A bounded run of mixed PCM audio emitted by the voice-activity gate.
///
/// Owns its sample buffer exclusively; it is produced once, handed to the
/// sidecar dispatcher, and discarded after transcription.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono PCM samples in [-1.0, 1.0] at `sample_rate`.
    pub samples: Vec<f32>,
    /// Session-relative start time (monotonic).
    pub start: Duration,
    /// Sample rate of `samples` in Hz.
    pub sample_rate: u32,
    pub kind: ChunkKind,
}

impl AudioChunk {
    /// Duration derived from the sample count.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Session-relative start in seconds.
    pub fn start_secs(&self) -> f64 {
        self.start.as_secs_f64()
    }
}

// ============================================================================
// Transcript & Diarization Types
// ============================================================================

/// A segment of transcribed text with timing information.
///
/// Produced incrementally during recording with `speaker` unset, then
/// rewritten wholesale after diarization with `speaker` set. Segments are
/// ordered by start time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    /// Start time in session-relative seconds.
    pub start: f64,
    /// End time in session-relative seconds.
    pub end: f64,
    /// Assigned speaker name or diarization label, `None` until labeled
    /// (or permanently `None` for alignment gaps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

impl TranscriptSegment {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// A single speaker turn from diarization.
///
/// Labels such as `SPEAKER_00` are per-meeting transient identifiers, not
/// cross-meeting identities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerInterval {
    /// Diarization label, serialized as `speaker` on the wire.
    #[serde(rename = "speaker")]
    pub label: String,
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds.
    pub end: f64,
}

impl SpeakerInterval {
    /// Length in seconds of the overlap between this interval and
    /// `[start, end)`. Zero when disjoint.
    pub fn overlap(&self, start: f64, end: f64) -> f64 {
        (self.end.min(end) - self.start.max(start)).max(0.0)
    }

    /// Whether the point `t` falls inside `[start, end)`.
    pub fn contains(&self, t: f64) -> bool {
        self.start <= t && t < self.end
    }
}

// ============================================================================
// Speaker Identity Types
// ============================================================================

/// A voice embedding with the number of samples folded into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerEmbedding {
    pub vector: Vec<f32>,
    pub sample_count: u32,
}

impl SpeakerEmbedding {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector,
            sample_count: 1,
        }
    }

    pub fn dim(&self) -> usize {
        self.vector.len()
    }
}

/// A persisted speaker identity, matched across meetings via its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownSpeaker {
    pub id: String,
    pub name: String,
    pub embedding: SpeakerEmbedding,
    pub created_at: String,
    pub updated_at: String,
}

/// A speaker detected in the current meeting, derived after diarization.
///
/// Recomputed on every diarization run and never persisted directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedSpeaker {
    /// Per-meeting diarization label (e.g. `SPEAKER_00`).
    pub label: String,
    /// Suggested identity from the embedding index, if any match cleared
    /// the similarity threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_name: Option<String>,
    /// Cosine similarity of the best match, 0.0 when no match.
    pub confidence: f32,
    /// Set when two known speakers scored within the tie epsilon of each
    /// other; the suggestion then needs explicit user disambiguation.
    #[serde(default)]
    pub ambiguous: bool,
    /// A few transcript segments attributed to this label, for display.
    #[serde(default)]
    pub excerpts: Vec<TranscriptSegment>,
}

// ============================================================================
// Session Types
// ============================================================================

/// Lifecycle stage of a meeting session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Recording,
    Diarizing,
    Labeling,
    Summarizing,
    Complete,
    Error,
}

impl SessionState {
    /// Terminal states cannot transition further for this session.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Error)
    }
}

/// Consistent point-in-time view of a session.
///
/// Collections are shared `Arc`s replaced wholesale on update, so a reader
/// holding a snapshot never observes a partially mutated transcript.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub state: SessionState,
    /// Failure message when `state == Error`.
    pub error: Option<String>,
    pub transcript: Arc<Vec<TranscriptSegment>>,
    pub detected_speakers: Arc<Vec<DetectedSpeaker>>,
    /// Path of the finalized WAV asset, set when recording stops.
    pub audio_path: Option<PathBuf>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// The hand-off contract to the storage collaborator once a summary exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryArtifact {
    pub meeting_id: String,
    pub speaker_names: Vec<String>,
    /// `YYYY-MM-DD`.
    pub date: String,
    pub markdown_content: String,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Core settings; persisted by the sidecar via `save_settings`/`load_settings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Summarization provider ("claude", "openai", "gemini", "ollama").
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Cosine-similarity threshold for cross-meeting speaker matching.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Microphone input device name (`None` for default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microphone_device: Option<String>,
    /// System audio loopback device name (`None` to record mic only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_device: Option<String>,
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_similarity_threshold() -> f32 {
    0.75
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            similarity_threshold: default_similarity_threshold(),
            microphone_device: None,
            system_device: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_overlap_disjoint_is_zero() {
        let iv = SpeakerInterval {
            label: "SPEAKER_00".into(),
            start: 0.0,
            end: 5.0,
        };
        assert_eq!(iv.overlap(6.0, 8.0), 0.0);
    }

    #[test]
    fn interval_overlap_partial() {
        let iv = SpeakerInterval {
            label: "SPEAKER_00".into(),
            start: 0.0,
            end: 10.0,
        };
        assert!((iv.overlap(9.0, 11.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn interval_contains_is_half_open() {
        let iv = SpeakerInterval {
            label: "SPEAKER_00".into(),
            start: 1.0,
            end: 2.0,
        };
        assert!(iv.contains(1.0));
        assert!(!iv.contains(2.0));
    }

    #[test]
    fn chunk_duration_from_samples() {
        let chunk = AudioChunk {
            samples: vec![0.0; 16_000],
            start: Duration::from_secs(3),
            sample_rate: 16_000,
            kind: ChunkKind::Speech,
        };
        assert_eq!(chunk.duration(), Duration::from_secs(1));
        assert_eq!(chunk.start_secs(), 3.0);
    }

    #[test]
    fn settings_defaults_apply_on_empty_json() {
        let s: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.provider, "ollama");
        assert_eq!(s.similarity_threshold, 0.75);
        assert!(s.api_key.is_none());
    }

    #[test]
    fn speaker_interval_uses_wire_field_name() {
        let iv = SpeakerInterval {
            label: "SPEAKER_01".into(),
            start: 1.5,
            end: 3.0,
        };
        let json = serde_json::to_value(&iv).unwrap();
        assert_eq!(json["speaker"], "SPEAKER_01");
        assert!(json.get("label").is_none());
    }
}
