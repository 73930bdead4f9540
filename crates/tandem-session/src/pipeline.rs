//! Meeting pipeline
//!
//! Sequences a session through recording, diarization, speaker labeling,
//! and summarization. The manager is the sole writer of session state;
//! readers observe progress through [`SessionStore::snapshot`].
//!
//! Labeling is event-driven: after diarization the session parks in
//! `Labeling` until `confirm_speakers` or `skip_labeling` is called. Chunk
//! transcriptions still in flight when recording stops are drained into the
//! transcript before diarization starts.

use crate::sidecar::{ChunkTranscription, Diarization, SidecarChannel};
use crate::state::SessionStore;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tandem_audio::{
    AudioMixer, DeviceSelector, GateConfig, MixerConfig, MixerHandle, VoiceActivityGate,
};
use tandem_speaker::{align_transcript, MatchOutcome, SpeakerEmbeddingIndex};
use tandem_types::{
    AudioChunk, ChunkKind, DetectedSpeaker, Error, Result, SessionState, Settings,
    SummaryArtifact, TranscriptSegment,
};
use tokio::sync::{mpsc, Mutex};

/// How many transcript segments each detected speaker carries for display.
const EXCERPTS_PER_SPEAKER: usize = 3;

/// Rolling context prompt length fed to chunk transcription, in chars.
const PROMPT_TAIL_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub data_dir: PathBuf,
    pub settings: Settings,
    pub mixer: MixerConfig,
    pub gate: GateConfig,
    /// Hint passed to diarization; two-party meetings pin this to 2.
    pub num_speakers: Option<u32>,
}

impl SessionConfig {
    pub fn new(data_dir: PathBuf, settings: Settings) -> Self {
        Self {
            data_dir,
            settings,
            mixer: MixerConfig::default(),
            gate: GateConfig::default(),
            num_speakers: Some(2),
        }
    }
}

/// One user decision from the labeling screen.
#[derive(Debug, Clone)]
pub struct SpeakerAssignment {
    /// Diarization label being named (e.g. `SPEAKER_00`).
    pub label: String,
    pub name: String,
}

struct ActiveRecording {
    mixer: MixerHandle,
    gate_thread: std::thread::JoinHandle<()>,
    transcriber: tokio::task::JoinHandle<()>,
}

struct PendingLabeling {
    /// Every per-meeting label awaiting a name, with or without an embedding.
    labels: BTreeSet<String>,
    embeddings: BTreeMap<String, Vec<f32>>,
    /// Best index match per label: (speaker id, suggested name).
    suggestions: HashMap<String, (String, String)>,
}

pub struct SessionManager {
    sidecar: Arc<SidecarChannel>,
    index: Arc<SpeakerEmbeddingIndex>,
    store: Arc<SessionStore>,
    config: SessionConfig,
    active: Mutex<Option<ActiveRecording>>,
    labeling: Mutex<Option<PendingLabeling>>,
}

impl SessionManager {
    pub fn new(sidecar: Arc<SidecarChannel>, config: SessionConfig) -> Result<Self> {
        let index = Arc::new(SpeakerEmbeddingIndex::new(config.data_dir.clone())?);
        Ok(Self {
            sidecar,
            index,
            store: Arc::new(SessionStore::new()),
            config,
            active: Mutex::new(None),
            labeling: Mutex::new(None),
        })
    }

    pub fn store(&self) -> Arc<SessionStore> {
        self.store.clone()
    }

    pub fn index(&self) -> &SpeakerEmbeddingIndex {
        &self.index
    }

    /// Start recording a new meeting. Rejected while a session is live.
    pub async fn start_recording(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(Error::SessionActive);
        }

        // The worker must be answering before any audio is committed.
        self.sidecar.health_check().await?;

        let session_id = uuid::Uuid::new_v4().to_string();
        self.store.begin(session_id.clone())?;

        let wav_path = self
            .config
            .data_dir
            .join("sessions")
            .join(format!("{session_id}.wav"));
        let selector = DeviceSelector {
            microphone: self.config.settings.microphone_device.clone(),
            system: self.config.settings.system_device.clone(),
            capture_system: self.config.settings.system_device.is_some(),
        };
        let mixer_config = self.config.mixer.clone();

        let mixer = tokio::task::spawn_blocking(move || {
            AudioMixer::start(selector, wav_path, mixer_config)
        })
        .await
        .map_err(|_| Error::Device("mixer startup panicked".into()))?
        .map_err(|e| Error::Device(e.to_string()));

        let mut mixer = match mixer {
            Ok(mixer) => mixer,
            Err(e) => {
                self.store.fail(e.to_string());
                return Err(e);
            }
        };

        let frames = match mixer.take_frames() {
            Some(frames) => frames,
            None => {
                let e = Error::Device("mixer produced no frame stream".into());
                self.store.fail(e.to_string());
                return Err(e);
            }
        };
        let (chunk_tx, chunk_rx) = mpsc::channel::<AudioChunk>(8);

        // The gate runs on its own thread: it consumes blocking mixer
        // frames and produces chunks for the async transcriber.
        let gate_config = self.config.gate.clone();
        let gate_thread = std::thread::Builder::new()
            .name("voice-gate".into())
            .spawn(move || {
                let mut gate = VoiceActivityGate::new(gate_config);
                while let Ok(frame) = frames.recv() {
                    for chunk in gate.push(&frame) {
                        if chunk_tx.blocking_send(chunk).is_err() {
                            return;
                        }
                    }
                }
                if let Some(chunk) = gate.flush() {
                    let _ = chunk_tx.blocking_send(chunk);
                }
            })
            .map_err(|e| Error::Device(format!("failed to spawn gate thread: {e}")))?;

        let transcriber = tokio::spawn(transcribe_chunks(
            self.sidecar.clone(),
            self.store.clone(),
            chunk_rx,
        ));

        *active = Some(ActiveRecording {
            mixer,
            gate_thread,
            transcriber,
        });
        Ok(())
    }

    /// Stop recording and run diarization. Leaves the session in `Labeling`
    /// awaiting `confirm_speakers` or `skip_labeling`.
    pub async fn stop_recording(&self) -> Result<()> {
        let recording = {
            let mut active = self.active.lock().await;
            active.take().ok_or(Error::InvalidState {
                op: "stop recording",
                state: self.store.state(),
            })?
        };
        self.store.transition(
            "stop recording",
            &[SessionState::Recording],
            SessionState::Diarizing,
        )?;

        let ActiveRecording {
            mixer,
            gate_thread,
            transcriber,
        } = recording;

        let stopped = tokio::task::spawn_blocking(move || mixer.stop())
            .await
            .map_err(|_| Error::Device("mixer shutdown panicked".into()))?;
        let (wav_path, stats) = match stopped {
            Ok(parts) => parts,
            Err(e) => {
                let e = Error::Device(e.to_string());
                self.store.fail(e.to_string());
                return Err(e);
            }
        };
        if stats.mic_samples_dropped + stats.system_samples_dropped + stats.frames_dropped > 0 {
            tracing::warn!(
                "Recording finished with drops: mic={} system={} frames={}",
                stats.mic_samples_dropped,
                stats.system_samples_dropped,
                stats.frames_dropped
            );
        }

        // Mixer shutdown disconnects the gate's frame receiver; the gate
        // flushes and closes the chunk channel, then the transcriber drains
        // in-flight chunks. Late transcriptions land before diarization.
        let _ = tokio::task::spawn_blocking(move || gate_thread.join()).await;
        let _ = transcriber.await;

        self.store.set_audio_path(wav_path.clone());
        self.process_recorded_audio(&wav_path).await
    }

    /// Diarize, align the transcript, and match speakers against the index.
    /// Failures land the session in `Error`.
    pub(crate) async fn process_recorded_audio(&self, wav_path: &Path) -> Result<()> {
        match self.diarize_and_detect(wav_path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.store.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn diarize_and_detect(&self, wav_path: &Path) -> Result<()> {
        let diarization = self
            .sidecar
            .diarize(wav_path, self.config.num_speakers)
            .await?;

        let snapshot = self.store.snapshot();
        let aligned = align_transcript(&snapshot.transcript, &diarization.turns);
        self.store.replace_transcript(aligned);

        let (detected, suggestions) = self.detect_speakers(&diarization);
        let labels: BTreeSet<String> = detected.iter().map(|d| d.label.clone()).collect();
        self.store.set_detected_speakers(detected);

        *self.labeling.lock().await = Some(PendingLabeling {
            labels,
            embeddings: diarization.embeddings,
            suggestions,
        });
        self.store.transition(
            "await labeling",
            &[SessionState::Diarizing],
            SessionState::Labeling,
        )
    }

    /// Build the per-meeting speaker list with identity suggestions.
    fn detect_speakers(
        &self,
        diarization: &Diarization,
    ) -> (Vec<DetectedSpeaker>, HashMap<String, (String, String)>) {
        let transcript = self.store.snapshot().transcript;
        let threshold = self.config.settings.similarity_threshold;

        // A worker may return turns without embeddings; the aligned
        // transcript still carries every label, so the list is built from
        // the union of both.
        let mut labels: BTreeSet<String> = diarization.embeddings.keys().cloned().collect();
        labels.extend(transcript.iter().filter_map(|s| s.speaker.clone()));

        let mut detected = Vec::new();
        let mut suggestions = HashMap::new();

        for label in &labels {
            let outcome = diarization
                .embeddings
                .get(label)
                .map(|embedding| self.index.match_embedding(embedding, threshold));
            let (suggested_name, confidence, ambiguous) = match &outcome {
                Some(MatchOutcome {
                    best: Some(m),
                    ambiguous,
                }) => {
                    suggestions.insert(label.clone(), (m.speaker.id.clone(), m.speaker.name.clone()));
                    (Some(m.speaker.name.clone()), m.similarity, *ambiguous)
                }
                _ => (None, 0.0, false),
            };

            let excerpts: Vec<TranscriptSegment> = transcript
                .iter()
                .filter(|s| s.speaker.as_deref() == Some(label.as_str()))
                .take(EXCERPTS_PER_SPEAKER)
                .cloned()
                .collect();

            detected.push(DetectedSpeaker {
                label: label.clone(),
                suggested_name,
                confidence,
                ambiguous,
                excerpts,
            });
        }

        (detected, suggestions)
    }

    /// Apply user-confirmed names, update the speaker index, and finish the
    /// session with a summary.
    pub async fn confirm_speakers(
        &self,
        assignments: Vec<SpeakerAssignment>,
    ) -> Result<SummaryArtifact> {
        self.store.transition(
            "confirm speakers",
            &[SessionState::Labeling],
            SessionState::Summarizing,
        )?;
        match self.confirm_inner(assignments).await {
            Ok(artifact) => Ok(artifact),
            Err(e) => {
                self.store.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn confirm_inner(
        &self,
        assignments: Vec<SpeakerAssignment>,
    ) -> Result<SummaryArtifact> {
        let pending = self
            .labeling
            .lock()
            .await
            .take()
            .ok_or(Error::NoActiveSession)?;

        let mut names = HashMap::new();
        for assignment in &assignments {
            // A confirmed suggestion reinforces the stored embedding; a
            // corrected name is treated as a new person. A label without
            // an embedding is renamed only.
            if let Some(embedding) = pending.embeddings.get(&assignment.label) {
                match pending.suggestions.get(&assignment.label) {
                    Some((id, suggested)) if *suggested == assignment.name => {
                        self.index.reinforce(id, embedding)?;
                    }
                    _ => {
                        self.index.add(&assignment.name, embedding.clone())?;
                    }
                }
            }
            names.insert(assignment.label.clone(), assignment.name.clone());
        }

        self.apply_names(&names);
        self.finish_summary().await
    }

    /// Skip identification: label speakers with generic ordinal names and
    /// leave the index untouched.
    pub async fn skip_labeling(&self) -> Result<SummaryArtifact> {
        self.store.transition(
            "skip labeling",
            &[SessionState::Labeling],
            SessionState::Summarizing,
        )?;
        match self.skip_inner().await {
            Ok(artifact) => Ok(artifact),
            Err(e) => {
                self.store.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn skip_inner(&self) -> Result<SummaryArtifact> {
        let pending = self
            .labeling
            .lock()
            .await
            .take()
            .ok_or(Error::NoActiveSession)?;

        // Labels sort lexicographically (SPEAKER_00, SPEAKER_01), so the
        // ordinals are stable across runs.
        let names: HashMap<String, String> = pending
            .labels
            .iter()
            .enumerate()
            .map(|(i, label)| (label.clone(), format!("Speaker {}", i + 1)))
            .collect();

        self.apply_names(&names);
        self.finish_summary().await
    }

    /// Rewrite every transcript segment's speaker from diarization label to
    /// display name. Unassigned labels keep the raw label; gaps stay bare.
    fn apply_names(&self, names: &HashMap<String, String>) {
        let snapshot = self.store.snapshot();
        let renamed: Vec<TranscriptSegment> = snapshot
            .transcript
            .iter()
            .map(|seg| {
                let mut seg = seg.clone();
                if let Some(label) = &seg.speaker {
                    if let Some(name) = names.get(label) {
                        seg.speaker = Some(name.clone());
                    }
                }
                seg
            })
            .collect();
        self.store.replace_transcript(renamed);
    }

    async fn finish_summary(&self) -> Result<SummaryArtifact> {
        let snapshot = self.store.snapshot();
        let settings = &self.config.settings;

        let api_key = required_api_key(settings)?;
        let transcript_text = render_transcript(&snapshot.transcript);

        let markdown = self
            .sidecar
            .summarize(
                transcript_text,
                settings.provider.clone(),
                settings.model.clone(),
                api_key,
            )
            .await?;

        let date = snapshot.started_at.format("%Y-%m-%d").to_string();
        validate_date(&date)?;

        let mut speaker_names: Vec<String> = snapshot
            .transcript
            .iter()
            .filter_map(|s| s.speaker.clone())
            .collect();
        speaker_names.sort();
        speaker_names.dedup();

        let artifact = SummaryArtifact {
            meeting_id: snapshot.id.clone(),
            speaker_names: speaker_names.clone(),
            date: date.clone(),
            markdown_content: markdown.clone(),
        };

        self.sidecar
            .save_summary(
                snapshot.id,
                settings.provider.clone(),
                settings.model.clone(),
                markdown,
                speaker_names,
                date,
            )
            .await?;

        self.store.transition(
            "complete",
            &[SessionState::Summarizing],
            SessionState::Complete,
        )?;
        Ok(artifact)
    }
}

/// Drain speech chunks into transcript segments until the channel closes.
async fn transcribe_chunks(
    sidecar: Arc<SidecarChannel>,
    store: Arc<SessionStore>,
    mut chunks: mpsc::Receiver<AudioChunk>,
) {
    let mut prompt = String::new();
    while let Some(chunk) = chunks.recv().await {
        if chunk.kind != ChunkKind::Speech {
            continue;
        }
        match sidecar.transcribe_chunk(&chunk, &prompt).await {
            Ok(transcription) => {
                if transcription.is_partial {
                    tracing::debug!("Partial transcription dropped: {}", transcription.text);
                    continue;
                }
                push_prompt(&mut prompt, &transcription.text);
                store.push_segments(session_segments(&chunk, transcription));
            }
            // One bad chunk costs its own text, not the session.
            Err(e) => tracing::warn!("Chunk transcription failed: {e}"),
        }
    }
}

/// Shift chunk-relative segment times to the session clock.
fn session_segments(chunk: &AudioChunk, t: ChunkTranscription) -> Vec<TranscriptSegment> {
    let offset = chunk.start_secs();
    if !t.segments.is_empty() {
        return t
            .segments
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .map(|mut s| {
                s.start += offset;
                s.end += offset;
                s.speaker = None;
                s
            })
            .collect();
    }
    if t.text.trim().is_empty() {
        return Vec::new();
    }
    vec![TranscriptSegment {
        text: t.text,
        start: offset,
        end: offset + chunk.duration().as_secs_f64(),
        speaker: None,
    }]
}

/// Keep the last `PROMPT_TAIL_CHARS` chars of spoken text as context.
fn push_prompt(prompt: &mut String, text: &str) {
    if !prompt.is_empty() {
        prompt.push(' ');
    }
    prompt.push_str(text);
    if prompt.chars().count() > PROMPT_TAIL_CHARS {
        *prompt = prompt
            .chars()
            .rev()
            .take(PROMPT_TAIL_CHARS)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
    }
}

/// Render the labeled transcript as `Name: text` lines for the summarizer.
fn render_transcript(segments: &[TranscriptSegment]) -> String {
    segments
        .iter()
        .map(|s| match &s.speaker {
            Some(name) => format!("{name}: {}", s.text),
            None => s.text.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Ollama runs locally and needs no key; every other provider does.
fn required_api_key(settings: &Settings) -> Result<String> {
    if settings.provider == "ollama" {
        return Ok(String::new());
    }
    settings
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            Error::Config(format!(
                "No API key configured for provider {}",
                settings.provider
            ))
        })
}

fn validate_date(date: &str) -> Result<()> {
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| Error::Config(format!("Invalid summary date: {date}")))
}
