//! Two-source mixer
//!
//! Combines microphone and system loopback audio into one mono stream at a
//! fixed rate. `MixerCore` holds the lockstep-mixing logic with no device
//! I/O; `AudioMixer` owns the cpal streams on a dedicated thread, since
//! cpal streams are not `Send` and must live where they were created.
//!
//! A source that stops delivering samples (unplugged headset, revoked
//! loopback) is substituted with silence after a stall threshold so the
//! surviving source keeps flowing. Mixed frames go out over a bounded
//! channel with `try_send`; a slow consumer loses frames, never stalls
//! capture.

use crate::capture::SourceCapture;
use crate::resample::StreamResampler;
use crate::wav::WavAssetWriter;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// Output rate of the mixed stream.
    pub target_sample_rate: u32,
    /// How often the mixer thread drains the capture rings.
    pub poll_interval: Duration,
    /// Polls with one side empty while the other has data before the empty
    /// side is treated as stalled and substituted with silence.
    pub stall_polls: u32,
    /// Per-source ring capacity in seconds of audio.
    pub ring_seconds: f32,
    /// Bounded capacity of the outgoing frame channel.
    pub frame_channel_capacity: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16_000,
            poll_interval: Duration::from_millis(50),
            stall_polls: 40,
            ring_seconds: 5.0,
            frame_channel_capacity: 64,
        }
    }
}

/// Which input devices to open. `None` means the host default; a `None`
/// system source records the microphone only.
#[derive(Debug, Clone, Default)]
pub struct DeviceSelector {
    pub microphone: Option<String>,
    pub system: Option<String>,
    /// False disables the loopback source entirely.
    pub capture_system: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MixerStats {
    pub mic_samples_dropped: u64,
    pub system_samples_dropped: u64,
    pub frames_dropped: u64,
}

/// Device-free mixing state: two pending queues combined in lockstep.
/// Each queue is capped; under persistent clock drift the faster side
/// sheds its oldest samples rather than growing without bound.
pub struct MixerCore {
    mic: Vec<f32>,
    system: Vec<f32>,
    dual: bool,
    mic_lost: bool,
    system_lost: bool,
    mic_stall: u32,
    system_stall: u32,
    stall_polls: u32,
    pending_capacity: usize,
    mic_overflow: u64,
    system_overflow: u64,
}

fn mix_saturating(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x + y).clamp(-1.0, 1.0))
        .collect()
}

/// Drop the oldest pending samples past the capacity, mirroring the
/// capture rings.
fn trim_pending(queue: &mut Vec<f32>, capacity: usize, label: &str) -> u64 {
    if queue.len() <= capacity {
        return 0;
    }
    let excess = queue.len() - capacity;
    queue.drain(..excess);
    tracing::warn!("{label} pending queue overflow, dropped {excess} samples");
    excess as u64
}

impl MixerCore {
    pub fn new(dual: bool, stall_polls: u32, pending_capacity: usize) -> Self {
        Self {
            mic: Vec::new(),
            system: Vec::new(),
            dual,
            mic_lost: false,
            system_lost: false,
            mic_stall: 0,
            system_stall: 0,
            stall_polls,
            pending_capacity,
            mic_overflow: 0,
            system_overflow: 0,
        }
    }

    pub fn feed_mic(&mut self, samples: &[f32]) {
        if !samples.is_empty() {
            self.mic_stall = 0;
        }
        self.mic.extend_from_slice(samples);
        self.mic_overflow += trim_pending(&mut self.mic, self.pending_capacity, "mic");
    }

    pub fn feed_system(&mut self, samples: &[f32]) {
        if !samples.is_empty() {
            self.system_stall = 0;
        }
        self.system.extend_from_slice(samples);
        self.system_overflow += trim_pending(&mut self.system, self.pending_capacity, "system");
    }

    /// Samples shed from each pending queue so far (mic, system).
    pub fn overflow_dropped(&self) -> (u64, u64) {
        (self.mic_overflow, self.system_overflow)
    }

    /// A lost source never recovers within the session; its queue is
    /// drained into silence from then on.
    pub fn mark_mic_lost(&mut self) {
        self.mic_lost = true;
    }

    pub fn mark_system_lost(&mut self) {
        self.system_lost = true;
    }

    pub fn both_lost(&self) -> bool {
        self.mic_lost && (!self.dual || self.system_lost)
    }

    /// Produce the next mixed frame. Called once per poll; an empty return
    /// means neither source had aligned data yet.
    pub fn poll(&mut self) -> Vec<f32> {
        if !self.dual || self.system_lost {
            return std::mem::take(&mut self.mic);
        }
        if self.mic_lost {
            return std::mem::take(&mut self.system);
        }

        let n = self.mic.len().min(self.system.len());
        if n > 0 {
            let mixed = mix_saturating(&self.mic[..n], &self.system[..n]);
            self.mic.drain(..n);
            self.system.drain(..n);
            return mixed;
        }

        // One side starved: count polls and fall back to pass-through once
        // the stall threshold is crossed, which equals mixing with silence.
        if self.mic.is_empty() && !self.system.is_empty() {
            self.mic_stall += 1;
            if self.mic_stall >= self.stall_polls {
                return std::mem::take(&mut self.system);
            }
        } else if self.system.is_empty() && !self.mic.is_empty() {
            self.system_stall += 1;
            if self.system_stall >= self.stall_polls {
                return std::mem::take(&mut self.mic);
            }
        }
        Vec::new()
    }

    /// Drain everything left, padding the shorter side with silence.
    pub fn flush(&mut self) -> Vec<f32> {
        let mic = std::mem::take(&mut self.mic);
        let system = std::mem::take(&mut self.system);
        if !self.dual {
            return mic;
        }
        let len = mic.len().max(system.len());
        let mut padded_mic = mic;
        padded_mic.resize(len, 0.0);
        let mut padded_sys = system;
        padded_sys.resize(len, 0.0);
        mix_saturating(&padded_mic, &padded_sys)
    }
}

/// Handle to a running mixer thread.
pub struct MixerHandle {
    stop: Arc<AtomicBool>,
    frames: Option<Receiver<Vec<f32>>>,
    done: Receiver<Result<(PathBuf, MixerStats)>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl MixerHandle {
    /// Take the receiver of mixed frames for the voice-activity gate. The
    /// receiver disconnects once the mixer stops.
    pub fn take_frames(&mut self) -> Option<Receiver<Vec<f32>>> {
        self.frames.take()
    }

    /// Stop capture, finalize the WAV asset, and return its path.
    pub fn stop(mut self) -> Result<(PathBuf, MixerStats)> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.done
            .recv()
            .context("Mixer thread exited without a result")?
    }
}

pub struct AudioMixer;

impl AudioMixer {
    /// Open the selected devices and start mixing into `wav_path`.
    ///
    /// Blocks until the devices are open so configuration errors surface
    /// here rather than mid-session.
    pub fn start(
        selector: DeviceSelector,
        wav_path: PathBuf,
        config: MixerConfig,
    ) -> Result<MixerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = std::sync::mpsc::sync_channel(config.frame_channel_capacity);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("audio-mixer".into())
            .spawn(move || {
                run_mixer_thread(selector, wav_path, config, thread_stop, frame_tx, ready_tx, done_tx);
            })
            .context("Failed to spawn mixer thread")?;

        ready_rx
            .recv()
            .context("Mixer thread died during startup")??;

        Ok(MixerHandle {
            stop,
            frames: Some(frame_rx),
            done: done_rx,
            thread: Some(thread),
        })
    }
}

fn run_mixer_thread(
    selector: DeviceSelector,
    wav_path: PathBuf,
    config: MixerConfig,
    stop: Arc<AtomicBool>,
    frame_tx: SyncSender<Vec<f32>>,
    ready_tx: std::sync::mpsc::Sender<Result<()>>,
    done_tx: std::sync::mpsc::Sender<Result<(PathBuf, MixerStats)>>,
) {
    type SystemSource = Option<(SourceCapture, StreamResampler)>;
    let setup = || -> Result<(SourceCapture, StreamResampler, SystemSource, WavAssetWriter)> {
        // Sized for the highest common device rate so the ring holds
        // `ring_seconds` of audio regardless of what the device negotiates.
        let ring_capacity = (192_000.0 * config.ring_seconds) as usize;

        let mic = SourceCapture::open(selector.microphone.as_deref(), ring_capacity, "mic")?;
        let mic_resampler = StreamResampler::new(mic.sample_rate(), config.target_sample_rate)?;
        let system = if selector.capture_system {
            let capture =
                SourceCapture::open(selector.system.as_deref(), ring_capacity, "system")?;
            let resampler =
                StreamResampler::new(capture.sample_rate(), config.target_sample_rate)?;
            Some((capture, resampler))
        } else {
            None
        };
        let wav = WavAssetWriter::create(&wav_path, config.target_sample_rate)?;
        Ok((mic, mic_resampler, system, wav))
    };

    let (mic, mut mic_resampler, mut system, mut wav) = match setup() {
        Ok(parts) => {
            let _ = ready_tx.send(Ok(()));
            parts
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Pending queues hold at most the ring budget at the target rate.
    let pending_capacity = (config.target_sample_rate as f32 * config.ring_seconds) as usize;
    let mut core = MixerCore::new(system.is_some(), config.stall_polls, pending_capacity);
    let mut stats = MixerStats::default();

    let emit = |frame: Vec<f32>, wav: &mut WavAssetWriter, stats: &mut MixerStats| {
        if frame.is_empty() {
            return;
        }
        if let Err(e) = wav.append(&frame) {
            tracing::error!("WAV append failed: {e}");
        }
        match frame_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                stats.frames_dropped += 1;
                tracing::warn!("Frame consumer lagging, mixed frame dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    };

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(config.poll_interval);

        if !mic.is_alive() {
            core.mark_mic_lost();
        }
        core.feed_mic(&drain_resampled(&mic, &mut mic_resampler));

        if let Some((capture, resampler)) = &mut system {
            if !capture.is_alive() {
                core.mark_system_lost();
            }
            core.feed_system(&drain_resampled(capture, resampler));
        }

        if core.both_lost() {
            tracing::error!("All capture sources lost, stopping mixer");
            break;
        }

        emit(core.poll(), &mut wav, &mut stats);
    }

    // Final drain so samples captured just before stop are not lost.
    core.feed_mic(&drain_resampled(&mic, &mut mic_resampler));
    core.feed_mic(&flush_resampler(&mut mic_resampler));
    if let Some((capture, resampler)) = &mut system {
        core.feed_system(&drain_resampled(capture, resampler));
        core.feed_system(&flush_resampler(resampler));
    }
    emit(core.flush(), &mut wav, &mut stats);

    let (mic_overflow, system_overflow) = core.overflow_dropped();
    stats.mic_samples_dropped = mic.dropped_total() + mic_overflow;
    stats.system_samples_dropped =
        system.as_ref().map(|(s, _)| s.dropped_total()).unwrap_or(0) + system_overflow;

    drop(mic);
    drop(system);

    let result = wav.finalize().map(|path| (path, stats));
    let _ = done_tx.send(result);
}

fn drain_resampled(capture: &SourceCapture, resampler: &mut StreamResampler) -> Vec<f32> {
    let raw = capture.drain();
    if raw.is_empty() {
        return raw;
    }
    match resampler.process(&raw) {
        Ok(samples) => samples,
        Err(e) => {
            tracing::error!("Resampling failed, batch discarded: {e}");
            Vec::new()
        }
    }
}

fn flush_resampler(resampler: &mut StreamResampler) -> Vec<f32> {
    match resampler.flush() {
        Ok(tail) => tail,
        Err(e) => {
            tracing::error!("Resampler flush failed: {e}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_mix_is_saturating_sum() {
        let mut core = MixerCore::new(true, 40, 16_000);
        core.feed_mic(&[0.5, 0.8, -0.9]);
        core.feed_system(&[0.2, 0.8, -0.9]);
        let frame = core.poll();
        assert_eq!(frame.len(), 3);
        assert!((frame[0] - 0.7).abs() < 1e-6);
        assert_eq!(frame[1], 1.0);
        assert_eq!(frame[2], -1.0);
    }

    #[test]
    fn lockstep_waits_for_both_sources() {
        let mut core = MixerCore::new(true, 40, 16_000);
        core.feed_mic(&[0.1; 100]);
        assert!(core.poll().is_empty(), "no frame until the system side has data");

        core.feed_system(&[0.1; 60]);
        let frame = core.poll();
        assert_eq!(frame.len(), 60, "mix only the aligned prefix");

        core.feed_system(&[0.1; 40]);
        assert_eq!(core.poll().len(), 40);
    }

    #[test]
    fn stalled_source_falls_back_to_silence() {
        let stall = 5;
        let mut core = MixerCore::new(true, stall, 16_000);
        core.feed_mic(&[0.3; 10]);

        // The system side never delivers; after the stall threshold the mic
        // passes through unmixed.
        for _ in 0..stall - 1 {
            assert!(core.poll().is_empty());
        }
        let frame = core.poll();
        assert_eq!(frame.len(), 10);
        assert!((frame[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn lost_source_degrades_to_the_survivor() {
        let mut core = MixerCore::new(true, 40, 16_000);
        core.feed_mic(&[0.2; 8]);
        core.mark_system_lost();
        assert_eq!(core.poll().len(), 8);
        assert!(!core.both_lost());

        core.mark_mic_lost();
        assert!(core.both_lost());
    }

    #[test]
    fn single_source_mode_passes_through() {
        let mut core = MixerCore::new(false, 40, 16_000);
        core.feed_mic(&[0.4; 16]);
        let frame = core.poll();
        assert_eq!(frame, vec![0.4; 16]);
    }

    #[test]
    fn flush_pads_the_shorter_side() {
        let mut core = MixerCore::new(true, 40, 16_000);
        core.feed_mic(&[0.5; 10]);
        core.feed_system(&[0.5; 4]);
        let frame = core.flush();
        assert_eq!(frame.len(), 10);
        assert_eq!(frame[0], 1.0);
        assert!((frame[9] - 0.5).abs() < 1e-6, "unmatched tail passes through");
    }

    #[test]
    fn pending_queues_stay_bounded_under_clock_drift() {
        let capacity = 2_000;
        let mut core = MixerCore::new(true, 40, capacity);

        // The mic clock runs slightly fast; its queue gains a sample per
        // poll and must shed the backlog instead of growing forever.
        for _ in 0..5_000 {
            core.feed_mic(&[0.1; 81]);
            core.feed_system(&[0.1; 80]);
            core.poll();
            assert!(core.mic.len() <= capacity);
            assert!(core.system.len() <= capacity);
        }

        let (mic_dropped, system_dropped) = core.overflow_dropped();
        assert!(mic_dropped > 0, "the faster side must drop its oldest samples");
        assert_eq!(system_dropped, 0);
    }

    #[test]
    fn feeding_resets_the_stall_counter() {
        let stall = 3;
        let mut core = MixerCore::new(true, stall, 16_000);
        core.feed_mic(&[0.1; 4]);
        assert!(core.poll().is_empty());
        assert!(core.poll().is_empty());

        // The system side recovers before the threshold.
        core.feed_system(&[0.1; 4]);
        assert_eq!(core.poll().len(), 4);
    }
}
