//! Audio capture using cpal
//!
//! One `SourceCapture` per input source. The stream callback downmixes to
//! mono and pushes into a shared bounded ring; it never blocks and never
//! allocates unboundedly. cpal streams are not `Send`, so captures are
//! created and dropped on the mixer thread that owns them.

use crate::ring::SourceRing;
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An enumerable input device.
#[derive(Debug, Clone)]
pub struct InputDevice {
    pub name: String,
    pub is_default: bool,
    pub channels: u16,
    pub sample_rate: u32,
}

/// A live cpal input stream feeding a bounded ring.
pub struct SourceCapture {
    _stream: cpal::Stream,
    ring: Arc<Mutex<SourceRing>>,
    alive: Arc<AtomicBool>,
    sample_rate: u32,
    label: &'static str,
}

impl SourceCapture {
    /// Open the named input device, or the host default when `None`.
    ///
    /// `label` identifies the source in logs ("mic" or "system").
    pub fn open(
        device_name: Option<&str>,
        ring_capacity: usize,
        label: &'static str,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name {
            host.input_devices()?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .with_context(|| format!("Input device not found: {name}"))?
        } else {
            host.default_input_device()
                .context("No default input device")?
        };

        let config = device.default_input_config()?;
        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;

        tracing::info!(
            "Capture source '{}': {} @ {}Hz, {} channels",
            label,
            device.name().unwrap_or_default(),
            sample_rate,
            channels
        );

        let ring = Arc::new(Mutex::new(SourceRing::new(ring_capacity)));
        let alive = Arc::new(AtomicBool::new(true));

        let cb_ring = ring.clone();
        let cb_alive = alive.clone();
        let err_alive = alive.clone();

        let stream = device.build_input_stream(
            &config.into(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !cb_alive.load(Ordering::Relaxed) {
                    return;
                }
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
                    .collect();
                cb_ring.lock().push(&mono);
            },
            move |err| {
                tracing::error!("Capture stream error ({label}): {err}");
                err_alive.store(false, Ordering::Relaxed);
            },
            None,
        )?;

        stream.play()?;

        Ok(Self {
            _stream: stream,
            ring,
            alive,
            sample_rate,
            label,
        })
    }

    /// Take everything buffered since the last drain.
    ///
    /// Logs once per drain when the ring overflowed in the interim.
    pub fn drain(&self) -> Vec<f32> {
        let mut ring = self.ring.lock();
        let before = ring.dropped_total();
        let samples = ring.drain_all();
        if ring.dropped_total() > before {
            tracing::warn!(
                "Capture ring overflow ({}): {} samples dropped",
                self.label,
                ring.dropped_total() - before
            );
        }
        samples
    }

    /// False once the stream has reported a fatal error.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Total samples dropped by ring overflow since the stream opened.
    pub fn dropped_total(&self) -> u64 {
        self.ring.lock().dropped_total()
    }
}

/// List available input devices.
pub fn list_input_devices() -> Result<Vec<InputDevice>> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices: Vec<InputDevice> = host
        .input_devices()?
        .filter_map(|device| {
            let name = device.name().ok()?;
            let config = device.default_input_config().ok()?;

            Some(InputDevice {
                is_default: default_name.as_ref() == Some(&name),
                channels: config.channels(),
                sample_rate: config.sample_rate().0,
                name,
            })
        })
        .collect();

    Ok(devices)
}
