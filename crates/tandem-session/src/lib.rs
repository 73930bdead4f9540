//! Session orchestration for Tandem
//!
//! Owns the worker process channel, the session state machine, and the
//! pipeline that takes a meeting from live recording through diarization,
//! speaker labeling, and summarization.

use std::path::PathBuf;

pub mod pipeline;
pub mod queries;
pub mod sidecar;
pub mod state;

pub use pipeline::{SessionConfig, SessionManager, SpeakerAssignment};
pub use sidecar::{SidecarChannel, SidecarConfig};
pub use state::SessionStore;

/// Default data directory for session assets and the speaker index.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tandem")
}
