//! Sidecar wire protocol.
//!
//! One JSON object per line, UTF-8, newline-terminated, over the worker
//! process's stdin/stdout. Both directions are closed tagged unions decoded
//! once at the transport boundary; unrecognized response types fall back to
//! [`SidecarResponse::Unknown`] for forward compatibility.
//!
//! Every request carries a monotonic `id` which the worker echoes in its
//! response; responses are correlated strictly by id, never by arrival order.

use crate::{SpeakerInterval, TranscriptSegment};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ============================================================================
// Requests (host -> worker)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarRequest {
    /// Verifies the worker is alive and its models are loaded. Must pass
    /// before any recording is allowed to start.
    Health { id: u64 },
    TranscribeChunk {
        id: u64,
        /// Base64-encoded mono WAV of the speech chunk.
        audio_base64: String,
        /// Context prompt carried from the preceding transcript.
        initial_prompt: String,
    },
    Diarize {
        id: u64,
        audio_path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        num_speakers: Option<u32>,
    },
    IdentifySpeakers {
        id: u64,
        embeddings: BTreeMap<String, Vec<f32>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        known_embeddings: Option<BTreeMap<String, Vec<f32>>>,
    },
    Summarize {
        id: u64,
        transcript: String,
        provider: String,
        model: String,
        api_key: String,
    },
    SaveSummary {
        id: u64,
        meeting_id: String,
        provider: String,
        model: String,
        content: String,
        speaker_names: Vec<String>,
        date: String,
    },
    GetAllSpeakers { id: u64 },
    GetSummariesForSpeaker { id: u64, speaker_name: String },
    GetSummaryDetail { id: u64, summary_id: String },
    SearchSummaries { id: u64, query: String },
    SaveSettings { id: u64, settings: Value },
    LoadSettings { id: u64 },
}

impl SidecarRequest {
    pub fn id(&self) -> u64 {
        match self {
            Self::Health { id }
            | Self::TranscribeChunk { id, .. }
            | Self::Diarize { id, .. }
            | Self::IdentifySpeakers { id, .. }
            | Self::Summarize { id, .. }
            | Self::SaveSummary { id, .. }
            | Self::GetAllSpeakers { id }
            | Self::GetSummariesForSpeaker { id, .. }
            | Self::GetSummaryDetail { id, .. }
            | Self::SearchSummaries { id, .. }
            | Self::SaveSettings { id, .. }
            | Self::LoadSettings { id } => *id,
        }
    }

    /// Wire name of the request kind, for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Health { .. } => "health",
            Self::TranscribeChunk { .. } => "transcribe_chunk",
            Self::Diarize { .. } => "diarize",
            Self::IdentifySpeakers { .. } => "identify_speakers",
            Self::Summarize { .. } => "summarize",
            Self::SaveSummary { .. } => "save_summary",
            Self::GetAllSpeakers { .. } => "get_all_speakers",
            Self::GetSummariesForSpeaker { .. } => "get_summaries_for_speaker",
            Self::GetSummaryDetail { .. } => "get_summary_detail",
            Self::SearchSummaries { .. } => "search_summaries",
            Self::SaveSettings { .. } => "save_settings",
            Self::LoadSettings { .. } => "load_settings",
        }
    }
}

// ============================================================================
// Responses (worker -> host)
// ============================================================================

/// One identity suggestion inside a `speaker_match` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerMatchEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryListEntry {
    pub summary_id: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultEntry {
    pub summary_id: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarResponse {
    Health {
        #[serde(default)]
        id: Option<u64>,
        status: String,
    },
    Transcription {
        #[serde(default)]
        id: Option<u64>,
        text: String,
        #[serde(default)]
        segments: Vec<TranscriptSegment>,
        #[serde(default)]
        is_partial: bool,
    },
    DiarizationComplete {
        #[serde(default)]
        id: Option<u64>,
        segments: Vec<SpeakerInterval>,
        /// Per-label voice embeddings for cross-meeting identification.
        #[serde(default)]
        embeddings: BTreeMap<String, Vec<f32>>,
    },
    SpeakerMatch {
        #[serde(default)]
        id: Option<u64>,
        matches: BTreeMap<String, SpeakerMatchEntry>,
    },
    SummaryComplete {
        #[serde(default)]
        id: Option<u64>,
        markdown: String,
    },
    SummarySaved {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Speakers {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default)]
        speakers: Vec<String>,
    },
    SummaryList {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default)]
        summaries: Vec<SummaryListEntry>,
    },
    SummaryDetail {
        #[serde(default)]
        id: Option<u64>,
        summary: Value,
    },
    SearchResults {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default)]
        results: Vec<SearchResultEntry>,
    },
    Settings {
        #[serde(default)]
        id: Option<u64>,
        settings: Value,
    },
    SettingsSaved {
        #[serde(default)]
        id: Option<u64>,
    },
    Error {
        #[serde(default)]
        id: Option<u64>,
        message: String,
    },
    /// Fallback for response types this build does not know about.
    #[serde(other)]
    Unknown,
}

impl SidecarResponse {
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Health { id, .. }
            | Self::Transcription { id, .. }
            | Self::DiarizationComplete { id, .. }
            | Self::SpeakerMatch { id, .. }
            | Self::SummaryComplete { id, .. }
            | Self::SummarySaved { id, .. }
            | Self::Speakers { id, .. }
            | Self::SummaryList { id, .. }
            | Self::SummaryDetail { id, .. }
            | Self::SearchResults { id, .. }
            | Self::Settings { id, .. }
            | Self::SettingsSaved { id }
            | Self::Error { id, .. } => *id,
            Self::Unknown => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Health { .. } => "health",
            Self::Transcription { .. } => "transcription",
            Self::DiarizationComplete { .. } => "diarization_complete",
            Self::SpeakerMatch { .. } => "speaker_match",
            Self::SummaryComplete { .. } => "summary_complete",
            Self::SummarySaved { .. } => "summary_saved",
            Self::Speakers { .. } => "speakers",
            Self::SummaryList { .. } => "summary_list",
            Self::SummaryDetail { .. } => "summary_detail",
            Self::SearchResults { .. } => "search_results",
            Self::Settings { .. } => "settings",
            Self::SettingsSaved { .. } => "settings_saved",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}
