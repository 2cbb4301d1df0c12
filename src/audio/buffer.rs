//! # Rolling Audio Buffer
//!
//! Fixed-capacity sliding window over a session's most recent audio. The buffer
//! starts as `capacity` samples of silence and never changes length: every append
//! pushes new samples onto the back and removes the same number from the front.
//!
//! ## Unprocessed samples:
//! Alongside the window the buffer counts samples appended since the last
//! inference attempt. The count is not capped by the capacity; the window handed
//! to the engine is `min(capacity, unprocessed + overlap)` samples long.

use std::collections::VecDeque;

/// Sliding window of normalized samples with an unprocessed-sample counter.
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    samples: VecDeque<f32>,
    capacity: usize,
    unprocessed: usize,
}

impl RollingBuffer {
    /// Create a buffer of `capacity` zero samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: std::iter::repeat(0.0).take(capacity).collect(),
            capacity,
            unprocessed: 0,
        }
    }

    /// Append a chunk, keeping only the most recent `capacity` samples.
    ///
    /// ## Returns:
    /// The number of samples from `chunk` that could not fit at all (the chunk
    /// was longer than the whole window). The caller decides how to report it.
    pub fn append(&mut self, chunk: &[f32]) -> usize {
        let dropped = chunk.len().saturating_sub(self.capacity);
        let kept = &chunk[dropped..];

        self.samples.drain(..kept.len());
        self.samples.extend(kept.iter().copied());
        self.unprocessed += chunk.len();

        dropped
    }

    /// Copy the newest `count` samples into the end of `window`.
    ///
    /// `window` is zeroed first so the unused leading region is silence and the
    /// tail holds the most recent audio. `count` is clamped to both the buffer
    /// capacity and the window length.
    pub fn copy_tail_into(&self, window: &mut [f32], count: usize) -> usize {
        window.fill(0.0);

        let count = count.min(self.capacity).min(window.len());
        let start = window.len() - count;
        for (dst, src) in window[start..]
            .iter_mut()
            .zip(self.samples.range(self.capacity - count..))
        {
            *dst = *src;
        }

        count
    }

    pub fn unprocessed(&self) -> usize {
        self.unprocessed
    }

    /// Mark every appended sample as consumed for triggering purposes.
    pub fn reset_unprocessed(&mut self) {
        self.unprocessed = 0;
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// The most recent `count` samples, oldest first.
    #[cfg(test)]
    pub fn tail(&self, count: usize) -> Vec<f32> {
        let count = count.min(self.capacity);
        self.samples.range(self.capacity - count..).copied().collect()
    }
}
