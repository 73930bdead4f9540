//! Mono resampling using rubato
//!
//! The mixer drains each capture ring every poll, so conversion runs as a
//! stream: one sinc filter per source, built once, with partial filter
//! windows carried across calls.

use anyhow::{Context, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Input samples per filter window.
const CHUNK_SAMPLES: usize = 1024;

fn sinc_params() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    }
}

/// Streaming mono resampler with fixed source and target rates.
pub struct StreamResampler {
    /// Absent when the rates match; process becomes a pass-through.
    inner: Option<SincFixedIn<f32>>,
    pending: Vec<f32>,
    source_rate: u32,
    target_rate: u32,
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self> {
        let inner = if source_rate == target_rate {
            None
        } else {
            let resampler = SincFixedIn::<f32>::new(
                target_rate as f64 / source_rate as f64,
                2.0,
                sinc_params(),
                CHUNK_SAMPLES,
                1, // mono
            )
            .with_context(|| {
                format!("Failed to build a {source_rate}->{target_rate} resampler")
            })?;
            Some(resampler)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
            source_rate,
            target_rate,
        })
    }

    /// Convert a batch. Input short of a full filter window is held back
    /// and prepended to the next call.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(inner) = &mut self.inner else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= CHUNK_SAMPLES {
            let frame = vec![self.pending[offset..offset + CHUNK_SAMPLES].to_vec()];
            offset += CHUNK_SAMPLES;
            let converted = inner.process(&frame, None)?;
            out.extend(converted.into_iter().next().unwrap_or_default());
        }
        self.pending.drain(..offset);
        Ok(out)
    }

    /// Convert whatever is still held back, zero-padded to a full window
    /// and trimmed to the held-back duration. Called once when the source
    /// stops delivering.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(inner) = &mut self.inner else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let remainder = self.pending.len();
        let mut frame = std::mem::take(&mut self.pending);
        frame.resize(CHUNK_SAMPLES, 0.0);
        let converted = inner.process(&[frame], None)?;
        let mut out = converted.into_iter().next().unwrap_or_default();
        let expected =
            (remainder as u64 * self.target_rate as u64 / self.source_rate as u64) as usize;
        out.truncate(expected);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_when_rates_match() {
        let mut resampler = StreamResampler::new(16_000, 16_000).unwrap();
        let samples = vec![0.1, -0.2, 0.3];
        assert_eq!(resampler.process(&samples).unwrap(), samples);
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn downsample_ratio_holds_across_batches() {
        let mut resampler = StreamResampler::new(48_000, 16_000).unwrap();
        let samples: Vec<f32> = (0..48_000)
            .map(|i| (i as f32 * 0.01).sin() * 0.5)
            .collect();

        let mut out = Vec::new();
        for batch in samples.chunks(2_400) {
            out.extend(resampler.process(batch).unwrap());
        }
        out.extend(resampler.flush().unwrap());

        let expected = samples.len() / 3;
        let tolerance = expected / 10;
        assert!(
            out.len().abs_diff(expected) < tolerance,
            "expected ~{expected} samples, got {}",
            out.len()
        );
    }

    #[test]
    fn batch_boundaries_do_not_change_the_output() {
        let samples: Vec<f32> = (0..9_600).map(|i| (i as f32 * 0.02).sin()).collect();

        let mut whole = StreamResampler::new(48_000, 16_000).unwrap();
        let mut a = whole.process(&samples).unwrap();
        a.extend(whole.flush().unwrap());

        let mut sliced = StreamResampler::new(48_000, 16_000).unwrap();
        let mut b = Vec::new();
        for piece in samples.chunks(317) {
            b.extend(sliced.process(piece).unwrap());
        }
        b.extend(sliced.flush().unwrap());

        assert_eq!(a, b);
    }
}
