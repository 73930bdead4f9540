//! Bounded per-source sample buffer.
//!
//! Each capture source writes into its own ring from the audio callback.
//! The ring has a fixed capacity; on overflow the oldest samples are
//! dropped so the callback never blocks and memory never grows. Drops are
//! counted so the mixer can log them.

use std::collections::VecDeque;

pub struct SourceRing {
    buf: VecDeque<f32>,
    capacity: usize,
    dropped: u64,
}

impl SourceRing {
    /// Create a ring holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Ring sized for `seconds` of audio at `sample_rate`.
    pub fn with_duration(sample_rate: u32, seconds: f32) -> Self {
        Self::new(((sample_rate as f32 * seconds) as usize).max(1))
    }

    /// Append samples, evicting the oldest on overflow.
    ///
    /// Returns the number of samples dropped by this push.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let incoming = if samples.len() > self.capacity {
            // The push alone exceeds capacity; only the newest tail survives.
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };
        let skipped = samples.len() - incoming.len();

        let overflow = (self.buf.len() + incoming.len()).saturating_sub(self.capacity);
        for _ in 0..overflow {
            self.buf.pop_front();
        }
        self.buf.extend(incoming.iter().copied());

        let dropped = skipped + overflow;
        self.dropped += dropped as u64;
        dropped
    }

    /// Remove and return every buffered sample, oldest first.
    pub fn drain_all(&mut self) -> Vec<f32> {
        self.buf.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total samples dropped over the ring's lifetime.
    pub fn dropped_total(&self) -> u64 {
        self.dropped
    }
}
