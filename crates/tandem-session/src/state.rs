//! Session state store
//!
//! Single-writer, many-reader. The pipeline is the only writer; readers
//! call [`SessionStore::snapshot`] and get a consistent copy-on-write view
//! where the collections are `Arc`s replaced wholesale, never mutated in
//! place.

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tandem_types::{
    DetectedSpeaker, Error, Result, SessionSnapshot, SessionState, TranscriptSegment,
};

pub struct SessionStore {
    inner: RwLock<SessionSnapshot>,
}

fn idle_snapshot() -> SessionSnapshot {
    SessionSnapshot {
        id: String::new(),
        state: SessionState::Idle,
        error: None,
        transcript: Arc::new(Vec::new()),
        detected_speakers: Arc::new(Vec::new()),
        audio_path: None,
        started_at: chrono::Utc::now(),
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(idle_snapshot()),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.read().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().state
    }

    /// Begin a new session. Only one can be live; a session in a terminal
    /// state is replaced.
    pub fn begin(&self, id: String) -> Result<()> {
        let mut inner = self.inner.write();
        if !matches!(inner.state, SessionState::Idle) && !inner.state.is_terminal() {
            return Err(Error::SessionActive);
        }
        *inner = SessionSnapshot {
            id,
            state: SessionState::Recording,
            error: None,
            transcript: Arc::new(Vec::new()),
            detected_speakers: Arc::new(Vec::new()),
            audio_path: None,
            started_at: chrono::Utc::now(),
        };
        tracing::info!("Session {} started", inner.id);
        Ok(())
    }

    /// Move to `next` if the current state is one of `from`.
    pub fn transition(
        &self,
        op: &'static str,
        from: &[SessionState],
        next: SessionState,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if !from.contains(&inner.state) {
            return Err(Error::InvalidState {
                op,
                state: inner.state,
            });
        }
        tracing::info!("Session {}: {:?} -> {next:?}", inner.id, inner.state);
        inner.state = next;
        Ok(())
    }

    /// Record a failure; the session ends in `Error` with an actionable
    /// message and a new session may start afterwards.
    pub fn fail(&self, message: impl Into<String>) {
        let mut inner = self.inner.write();
        let message = message.into();
        tracing::error!("Session {} failed: {message}", inner.id);
        inner.state = SessionState::Error;
        inner.error = Some(message);
    }

    /// Append transcript segments, keeping start order.
    pub fn push_segments(&self, segments: Vec<TranscriptSegment>) {
        if segments.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        let mut transcript: Vec<TranscriptSegment> = (*inner.transcript).clone();
        transcript.extend(segments);
        transcript.sort_by(|a, b| a.start.total_cmp(&b.start));
        inner.transcript = Arc::new(transcript);
    }

    /// Replace the whole transcript, e.g. after diarization alignment or
    /// speaker labeling.
    pub fn replace_transcript(&self, transcript: Vec<TranscriptSegment>) {
        self.inner.write().transcript = Arc::new(transcript);
    }

    pub fn set_detected_speakers(&self, speakers: Vec<DetectedSpeaker>) {
        self.inner.write().detected_speakers = Arc::new(speakers);
    }

    pub fn set_audio_path(&self, path: PathBuf) {
        self.inner.write().audio_path = Some(path);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            text: text.to_string(),
            start,
            end: start + 1.0,
            speaker: None,
        }
    }

    #[test]
    fn begin_while_recording_is_rejected() {
        let store = SessionStore::new();
        store.begin("a".into()).unwrap();
        let err = store.begin("b".into()).unwrap_err();
        assert!(matches!(err, Error::SessionActive));
        assert_eq!(store.snapshot().id, "a");
    }

    #[test]
    fn begin_after_terminal_state_replaces_the_session() {
        let store = SessionStore::new();
        store.begin("a".into()).unwrap();
        store.fail("worker died");
        store.begin("b".into()).unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.id, "b");
        assert_eq!(snap.state, SessionState::Recording);
        assert!(snap.error.is_none());
        assert!(snap.transcript.is_empty());
    }

    #[test]
    fn invalid_transition_is_a_typed_error() {
        let store = SessionStore::new();
        let err = store
            .transition(
                "stop recording",
                &[SessionState::Recording],
                SessionState::Diarizing,
            )
            .unwrap_err();
        match err {
            Error::InvalidState { op, state } => {
                assert_eq!(op, "stop recording");
                assert_eq!(state, SessionState::Idle);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let store = SessionStore::new();
        store.begin("a".into()).unwrap();
        store.push_segments(vec![seg(0.0, "one")]);

        let before = store.snapshot();
        store.push_segments(vec![seg(1.0, "two")]);

        assert_eq!(before.transcript.len(), 1);
        assert_eq!(store.snapshot().transcript.len(), 2);
    }

    #[test]
    fn segments_are_kept_in_start_order() {
        let store = SessionStore::new();
        store.begin("a".into()).unwrap();
        store.push_segments(vec![seg(5.0, "later")]);
        store.push_segments(vec![seg(1.0, "earlier")]);

        let snap = store.snapshot();
        assert_eq!(snap.transcript[0].text, "earlier");
        assert_eq!(snap.transcript[1].text, "later");
    }

    #[test]
    fn fail_records_the_message() {
        let store = SessionStore::new();
        store.begin("a".into()).unwrap();
        store.fail("No API key configured for provider claude");

        let snap = store.snapshot();
        assert_eq!(snap.state, SessionState::Error);
        assert_eq!(
            snap.error.as_deref(),
            Some("No API key configured for provider claude")
        );
    }
}
