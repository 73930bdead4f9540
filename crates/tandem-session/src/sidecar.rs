//! Worker process channel
//!
//! Owns the ML worker as a child process and speaks the NDJSON protocol
//! over its stdin/stdout. A single writer task serializes all outbound
//! requests; a reader task decodes each line once and resolves the pending
//! request with the matching id. Responses are correlated strictly by id,
//! so out-of-order replies from the worker are fine.
//!
//! The transport is generic over `AsyncRead`/`AsyncWrite`; tests drive the
//! channel through an in-memory duplex pipe instead of a process.

use base64::Engine as _;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_types::protocol::{SidecarRequest, SidecarResponse};
use tandem_types::{AudioChunk, Error, Result, SpeakerInterval, TranscriptSegment};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

/// Health checks and storage queries.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// A single speech chunk transcription.
pub const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);
/// Full-meeting diarization and summarization.
pub const HEAVY_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
}

/// A chunk transcription as returned by the worker, chunk-relative.
#[derive(Debug, Clone)]
pub struct ChunkTranscription {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    pub is_partial: bool,
}

/// Diarization of the full session audio.
#[derive(Debug, Clone)]
pub struct Diarization {
    pub turns: Vec<SpeakerInterval>,
    pub embeddings: BTreeMap<String, Vec<f32>>,
}

struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<SidecarResponse>>>,
    /// Bumped on restart so a stale reader cannot fail fresh requests.
    generation: AtomicU64,
}

impl Shared {
    /// Drop every pending sender; their callers see `SidecarUnavailable`.
    fn fail_all(&self) {
        let count = {
            let mut pending = self.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        if count > 0 {
            tracing::warn!("Worker connection lost, {count} in-flight requests failed");
        }
    }
}

struct Inner {
    tx: mpsc::Sender<String>,
    child: Option<Child>,
}

pub struct SidecarChannel {
    shared: Arc<Shared>,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    config: Option<SidecarConfig>,
}

impl SidecarChannel {
    /// Launch the worker process and connect to its stdio.
    pub fn spawn(config: SidecarConfig) -> Result<Self> {
        let (child, stdout, stdin) = launch(&config)?;
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        });
        let tx = start_io(&shared, stdout, stdin);
        Ok(Self {
            shared,
            inner: Mutex::new(Inner {
                tx,
                child: Some(child),
            }),
            next_id: AtomicU64::new(0),
            config: Some(config),
        })
    }

    /// Connect to an arbitrary transport; used by tests via
    /// `tokio::io::duplex`.
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        });
        let tx = start_io(&shared, reader, writer);
        Self {
            shared,
            inner: Mutex::new(Inner { tx, child: None }),
            next_id: AtomicU64::new(0),
            config: None,
        }
    }

    /// Replace the worker process. In-flight requests fail; audio assets on
    /// disk are untouched.
    pub fn restart(&self) -> Result<()> {
        let config = self.config.clone().ok_or_else(|| {
            Error::SidecarUnavailable("channel has no spawn configuration to restart".into())
        })?;

        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.fail_all();

        let (child, stdout, stdin) = launch(&config)?;
        let tx = start_io(&self.shared, stdout, stdin);

        let mut inner = self.inner.lock();
        if let Some(mut old) = inner.child.take() {
            let _ = old.start_kill();
        }
        inner.tx = tx;
        inner.child = Some(child);

        tracing::info!("Worker restarted");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<String> {
        match self
            .request(|id| SidecarRequest::Health { id }, QUERY_TIMEOUT)
            .await?
        {
            SidecarResponse::Health { status, .. } => Ok(status),
            other => Err(unexpected("health", &other)),
        }
    }

    /// Transcribe one speech chunk. Segment times in the result are
    /// chunk-relative; the caller offsets them by the chunk start.
    pub async fn transcribe_chunk(
        &self,
        chunk: &AudioChunk,
        initial_prompt: &str,
    ) -> Result<ChunkTranscription> {
        let wav = tandem_audio::samples_to_wav_bytes(&chunk.samples, chunk.sample_rate)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let audio_base64 = base64::engine::general_purpose::STANDARD.encode(wav);
        let initial_prompt = initial_prompt.to_string();

        match self
            .request(
                move |id| SidecarRequest::TranscribeChunk {
                    id,
                    audio_base64,
                    initial_prompt,
                },
                TRANSCRIBE_TIMEOUT,
            )
            .await?
        {
            SidecarResponse::Transcription {
                text,
                segments,
                is_partial,
                ..
            } => Ok(ChunkTranscription {
                text,
                segments,
                is_partial,
            }),
            other => Err(unexpected("transcribe_chunk", &other)),
        }
    }

    pub async fn diarize(
        &self,
        audio_path: &Path,
        num_speakers: Option<u32>,
    ) -> Result<Diarization> {
        let audio_path = audio_path.to_string_lossy().into_owned();
        match self
            .request(
                move |id| SidecarRequest::Diarize {
                    id,
                    audio_path,
                    num_speakers,
                },
                HEAVY_TIMEOUT,
            )
            .await?
        {
            SidecarResponse::DiarizationComplete {
                segments,
                embeddings,
                ..
            } => Ok(Diarization {
                turns: segments,
                embeddings,
            }),
            other => Err(unexpected("diarize", &other)),
        }
    }

    pub async fn summarize(
        &self,
        transcript: String,
        provider: String,
        model: String,
        api_key: String,
    ) -> Result<String> {
        match self
            .request(
                move |id| SidecarRequest::Summarize {
                    id,
                    transcript,
                    provider,
                    model,
                    api_key,
                },
                HEAVY_TIMEOUT,
            )
            .await?
        {
            SidecarResponse::SummaryComplete { markdown, .. } => Ok(markdown),
            other => Err(unexpected("summarize", &other)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn save_summary(
        &self,
        meeting_id: String,
        provider: String,
        model: String,
        content: String,
        speaker_names: Vec<String>,
        date: String,
    ) -> Result<Option<String>> {
        match self
            .request(
                move |id| SidecarRequest::SaveSummary {
                    id,
                    meeting_id,
                    provider,
                    model,
                    content,
                    speaker_names,
                    date,
                },
                QUERY_TIMEOUT,
            )
            .await?
        {
            SidecarResponse::SummarySaved { path, .. } => Ok(path),
            other => Err(unexpected("save_summary", &other)),
        }
    }

    /// Issue a request and await the response with the matching id.
    pub(crate) async fn request(
        &self,
        build: impl FnOnce(u64) -> SidecarRequest,
        timeout: Duration,
    ) -> Result<SidecarResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = build(id);
        let kind = req.kind();
        let line = serde_json::to_string(&req)?;

        let (resp_tx, resp_rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, resp_tx);

        let tx = self.inner.lock().tx.clone();
        if tx.send(line).await.is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(Error::SidecarUnavailable(
                "worker is not accepting requests".into(),
            ));
        }

        match tokio::time::timeout(timeout, resp_rx).await {
            Err(_) => {
                // A reply arriving after this point finds no pending entry
                // and is dropped by the reader.
                self.shared.pending.lock().remove(&id);
                Err(Error::SidecarTimeout { kind, timeout })
            }
            Ok(Err(_)) => Err(Error::SidecarUnavailable(
                "worker closed the connection".into(),
            )),
            Ok(Ok(SidecarResponse::Error { message, .. })) => {
                Err(Error::SidecarRequestFailed { kind, message })
            }
            Ok(Ok(resp)) => Ok(resp),
        }
    }
}

fn unexpected(kind: &'static str, resp: &SidecarResponse) -> Error {
    Error::SidecarRequestFailed {
        kind,
        message: format!("unexpected {} response", resp.kind()),
    }
}

fn launch(config: &SidecarConfig) -> Result<(Child, ChildStdout, ChildStdin)> {
    let mut child = Command::new(&config.command)
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| Error::SidecarUnavailable(format!("failed to launch worker: {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::SidecarUnavailable("worker stdin not piped".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::SidecarUnavailable("worker stdout not piped".into()))?;

    tracing::info!("Worker launched: {:?}", config.command);
    Ok((child, stdout, stdin))
}

/// Spawn the writer and reader tasks for one connection. Returns the
/// outbound line sender.
fn start_io<R, W>(shared: &Arc<Shared>, reader: R, mut writer: W) -> mpsc::Sender<String>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(64);

    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                tracing::warn!("Worker stdin closed, writer task exiting");
                break;
            }
        }
    });

    let shared = shared.clone();
    let generation = shared.generation.load(Ordering::SeqCst);
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Worker stdout read failed: {e}");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let resp: SidecarResponse = match serde_json::from_str(&line) {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!("Undecodable worker line, dropped: {e}");
                    continue;
                }
            };

            match resp.id() {
                Some(id) => {
                    let sender = shared.pending.lock().remove(&id);
                    match sender {
                        Some(sender) => {
                            let _ = sender.send(resp);
                        }
                        None => tracing::debug!(
                            "Response {} for unknown or expired id {id}, dropped",
                            resp.kind()
                        ),
                    }
                }
                None => tracing::warn!("Response {} carries no id, dropped", resp.kind()),
            }
        }

        // Only the current connection's reader may fail the pending set; a
        // reader left over from before a restart must not.
        if shared.generation.load(Ordering::SeqCst) == generation {
            shared.fail_all();
        }
    });

    tx
}
