//! Audio crate for Tandem
//!
//! Provides live two-source capture, bounded buffering, mixing, resampling,
//! WAV asset writing, and the voice-activity gate that segments the mixed
//! stream into speech chunks.

pub mod capture;
pub mod gate;
pub mod mixer;
pub mod resample;
pub mod ring;
pub mod wav;

pub use capture::{list_input_devices, InputDevice, SourceCapture};
pub use gate::{GateConfig, VoiceActivityGate};
pub use mixer::{AudioMixer, DeviceSelector, MixerConfig, MixerCore, MixerHandle, MixerStats};
pub use resample::StreamResampler;
pub use ring::SourceRing;
pub use wav::{samples_to_wav_bytes, WavAssetWriter};
