//! Voice-activity gate
//!
//! Classifies fixed-size windows of the mixed stream by RMS energy and
//! segments speech into bounded chunks with hysteresis: a chunk opens only
//! after several consecutive speech windows and closes only after a longer
//! run of silence windows, so brief pauses do not fragment an utterance.

use tandem_types::{AudioChunk, ChunkKind};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub sample_rate: u32,
    /// Window length in samples (30ms at 16kHz).
    pub window_samples: usize,
    /// RMS energy at or above which a window counts as speech.
    pub rms_threshold: f32,
    /// Consecutive speech windows required to open a chunk.
    pub open_windows: usize,
    /// Consecutive silence windows required to close a chunk.
    pub close_windows: usize,
    /// Hard cap on chunk length; longer speech is split.
    pub max_chunk: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            window_samples: 480,
            rms_threshold: 0.015,
            open_windows: 3,
            close_windows: 25,
            max_chunk: Duration::from_secs(30),
        }
    }
}

enum GateState {
    Closed {
        /// Candidate speech windows buffered while counting the streak.
        pending: Vec<f32>,
        pending_start: u64,
        streak: usize,
    },
    Open {
        chunk: Vec<f32>,
        chunk_start: u64,
        silence_streak: usize,
    },
}

impl GateState {
    fn closed() -> Self {
        GateState::Closed {
            pending: Vec::new(),
            pending_start: 0,
            streak: 0,
        }
    }
}

pub struct VoiceActivityGate {
    config: GateConfig,
    state: GateState,
    /// Samples waiting for a full window.
    residual: Vec<f32>,
    /// Session sample clock: index of the next window's first sample.
    clock: u64,
    max_chunk_samples: usize,
}

fn rms(window: &[f32]) -> f32 {
    if window.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = window.iter().map(|s| s * s).sum();
    (sum_sq / window.len() as f32).sqrt()
}

impl VoiceActivityGate {
    pub fn new(config: GateConfig) -> Self {
        let max_chunk_samples =
            (config.max_chunk.as_secs_f64() * config.sample_rate as f64) as usize;
        Self {
            state: GateState::closed(),
            residual: Vec::new(),
            clock: 0,
            max_chunk_samples,
            config,
        }
    }

    /// Feed mixed samples; returns any chunks completed by this push.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioChunk> {
        self.residual.extend_from_slice(samples);

        let mut out = Vec::new();
        let window = self.config.window_samples;
        let mut offset = 0;
        while self.residual.len() - offset >= window {
            let win: Vec<f32> = self.residual[offset..offset + window].to_vec();
            offset += window;
            self.process_window(&win, &mut out);
        }
        self.residual.drain(..offset);
        out
    }

    /// Close and return the in-progress chunk, if any. Called on stop so no
    /// trailing speech is lost.
    pub fn flush(&mut self) -> Option<AudioChunk> {
        let residual = std::mem::take(&mut self.residual);
        self.clock += residual.len() as u64;

        let prev = std::mem::replace(&mut self.state, GateState::closed());
        match prev {
            GateState::Open {
                mut chunk,
                chunk_start,
                silence_streak,
            } => {
                chunk.extend_from_slice(&residual);
                self.finish_chunk(chunk, chunk_start, silence_streak)
            }
            GateState::Closed { .. } => None,
        }
    }

    fn process_window(&mut self, win: &[f32], out: &mut Vec<AudioChunk>) {
        let window_start = self.clock;
        self.clock += win.len() as u64;
        let is_speech = rms(win) >= self.config.rms_threshold;

        let state = std::mem::replace(&mut self.state, GateState::closed());
        self.state = match state {
            GateState::Closed {
                mut pending,
                mut pending_start,
                mut streak,
            } => {
                if is_speech {
                    if streak == 0 {
                        pending_start = window_start;
                    }
                    pending.extend_from_slice(win);
                    streak += 1;
                    if streak >= self.config.open_windows {
                        GateState::Open {
                            chunk: pending,
                            chunk_start: pending_start,
                            silence_streak: 0,
                        }
                    } else {
                        GateState::Closed {
                            pending,
                            pending_start,
                            streak,
                        }
                    }
                } else {
                    GateState::closed()
                }
            }
            GateState::Open {
                mut chunk,
                chunk_start,
                mut silence_streak,
            } => {
                chunk.extend_from_slice(win);
                if is_speech {
                    silence_streak = 0;
                } else {
                    silence_streak += 1;
                }

                let trailing = (silence_streak * self.config.window_samples).min(chunk.len());
                if silence_streak >= self.config.close_windows {
                    out.extend(self.finish_chunk(chunk, chunk_start, silence_streak));
                    GateState::closed()
                } else if chunk.len() - trailing >= self.max_chunk_samples {
                    // Forced split: emit the speech so far and keep the gate
                    // open. Trailing silence does not count toward the cap
                    // and carries into the next chunk, so the close
                    // hysteresis keeps counting across the split.
                    let carried = chunk[chunk.len() - trailing..].to_vec();
                    let carried_start = self.clock - carried.len() as u64;
                    out.extend(self.finish_chunk(chunk, chunk_start, silence_streak));
                    GateState::Open {
                        chunk: carried,
                        chunk_start: carried_start,
                        silence_streak,
                    }
                } else {
                    GateState::Open {
                        chunk,
                        chunk_start,
                        silence_streak,
                    }
                }
            }
        };
    }

    /// Trim trailing silence windows and build the chunk.
    fn finish_chunk(
        &self,
        mut samples: Vec<f32>,
        start_sample: u64,
        trailing_silence_windows: usize,
    ) -> Option<AudioChunk> {
        let trim = (trailing_silence_windows * self.config.window_samples).min(samples.len());
        samples.truncate(samples.len() - trim);
        if samples.is_empty() {
            return None;
        }
        Some(AudioChunk {
            start: Duration::from_secs_f64(start_sample as f64 / self.config.sample_rate as f64),
            sample_rate: self.config.sample_rate,
            kind: ChunkKind::Speech,
            samples,
        })
    }
}
