//! Error taxonomy for the Tandem core.
//!
//! Alignment gaps and low-confidence speaker matches are deliberately not
//! errors: a gap is an unassigned speaker, a weak match is a new speaker.

use crate::SessionState;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A capture device is unavailable or disconnected. Fatal only when no
    /// source remains; otherwise the mixer degrades to the remaining source.
    #[error("audio device unavailable: {0}")]
    Device(String),

    /// OS-level audio/screen permission denied. The user must grant the
    /// permission and restart; no session can start until then.
    #[error("audio permission denied: {0}")]
    Permission(String),

    /// The worker process is not running or not answering health checks.
    /// Recoverable by restarting the sidecar.
    #[error("sidecar unavailable: {0}")]
    SidecarUnavailable(String),

    /// A specific sidecar request errored. Fatal to the current pipeline
    /// stage; never retried automatically.
    #[error("sidecar {kind} request failed: {message}")]
    SidecarRequestFailed {
        kind: &'static str,
        message: String,
    },

    /// A sidecar request exceeded its deadline. Reported, never silently
    /// retried; retries are a user action.
    #[error("sidecar {kind} request timed out after {timeout:?}")]
    SidecarTimeout {
        kind: &'static str,
        timeout: Duration,
    },

    /// Starting a recording while a session is active is rejected, not
    /// queued.
    #[error("a session is already active")]
    SessionActive,

    #[error("no active session")]
    NoActiveSession,

    #[error("cannot {op} while session is {state:?}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    /// An actionable configuration problem, e.g. a missing API key.
    #[error("{0}")]
    Config(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    EmbeddingDimension { expected: usize, got: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_actionable() {
        let err = Error::Config("No API key configured for provider claude".into());
        assert_eq!(
            err.to_string(),
            "No API key configured for provider claude"
        );

        let err = Error::InvalidState {
            op: "stop recording",
            state: SessionState::Idle,
        };
        assert!(err.to_string().contains("stop recording"));
        assert!(err.to_string().contains("Idle"));
    }
}
