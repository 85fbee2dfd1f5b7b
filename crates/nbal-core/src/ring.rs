//! Fixed-window rolling average over a circular buffer.
//!
//! Both the counter collector (one window per CPU counter) and the process
//! sampler (one window of CPU-time deltas per tracked process) accumulate
//! samples into a [`RollingAverage`]. The mean is only meaningful once the
//! window is fully populated — callers gate on [`RollingAverage::is_warm`]
//! before acting on it.
//!
//! # Thread safety
//!
//! Not thread-safe. The counter collector serializes access with its own
//! mutex; the sampler owns its windows exclusively.

/// A circular accumulator of the last `capacity` samples with a windowed mean.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    buf: Vec<f64>,
    index: usize,
    len: usize,
}

impl RollingAverage {
    /// Create a window holding the last `capacity` samples.
    ///
    /// `capacity` is clamped to at least 1 so a degenerate configuration
    /// (e.g. analysis period shorter than the switching frequency) still
    /// produces a usable window.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { buf: vec![0.0; capacity], index: 0, len: 0 }
    }

    /// Add a sample, overwriting the oldest one once the window is full.
    pub fn add(&mut self, value: f64) {
        self.buf[self.index] = value;
        self.index += 1;
        if self.index >= self.buf.len() {
            self.index = 0;
        }
        if self.len < self.buf.len() {
            self.len += 1;
        }
    }

    /// Number of samples currently held, saturating at `capacity`.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Window size.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// `true` once the window holds `capacity` samples.
    pub fn is_warm(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Mean of the held samples, or `None` if no sample was added yet.
    pub fn avg(&self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        Some(self.buf[..self.len].iter().sum::<f64>() / self.len as f64)
    }
}
