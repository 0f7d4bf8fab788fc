//! High-Resolution Timers
//!
//! Timing utilities for per-frame streaming statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// High-resolution timer for performance measurement
#[derive(Debug)]
pub struct HighResTimer {
    start: Instant,
}

impl HighResTimer {
    /// Create and start a new timer
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Restart the timer
    pub fn reset(&mut self) {
        self.start = Instant::now();
    }

    /// Elapsed time since the timer started
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for HighResTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped timer that reports its duration on drop
pub struct ScopedTimer<'a> {
    name: &'a str,
    start: Instant,
    callback: Option<Box<dyn FnMut(&str, Duration) + 'a>>,
}

impl<'a> ScopedTimer<'a> {
    /// Create a scoped timer that hands its duration to a callback
    pub fn new<F>(name: &'a str, callback: F) -> Self
    where
        F: FnMut(&str, Duration) + 'a,
    {
        Self {
            name,
            start: Instant::now(),
            callback: Some(Box::new(callback)),
        }
    }

    /// Create a scoped timer that emits a tracing event
    pub fn traced(name: &'a str) -> Self {
        Self {
            name,
            start: Instant::now(),
            callback: None,
        }
    }

    /// Elapsed time so far
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        match self.callback.take() {
            Some(mut callback) => callback(self.name, duration),
            None => tracing::debug!(
                target: "tessera::timing",
                name = self.name,
                duration_us = duration.as_micros() as u64,
                "Timer completed"
            ),
        }
    }
}

/// Fixed-window rolling statistics over duration samples
#[derive(Debug, Clone)]
pub struct RollingTimer {
    samples: Vec<f64>,
    index: usize,
    count: usize,
}

impl RollingTimer {
    /// Create a rolling window holding `sample_count` samples
    pub fn new(sample_count: usize) -> Self {
        Self {
            samples: vec![0.0; sample_count.max(1)],
            index: 0,
            count: 0,
        }
    }

    /// Record a sample in seconds
    pub fn record(&mut self, sample: f64) {
        self.samples[self.index] = sample;
        self.index = (self.index + 1) % self.samples.len();
        self.count = (self.count + 1).min(self.samples.len());
    }

    /// Record a sample from a duration
    pub fn record_duration(&mut self, duration: Duration) {
        self.record(duration.as_secs_f64());
    }

    fn window(&self) -> &[f64] {
        &self.samples[..self.count]
    }

    /// Mean of the window, zero when empty
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.window().iter().sum::<f64>() / self.count as f64
    }

    /// Largest sample in the window
    pub fn max(&self) -> f64 {
        self.window().iter().copied().reduce(f64::max).unwrap_or(0.0)
    }

    /// Number of samples in the window
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Thread-safe operation counter with accumulated timing
#[derive(Debug)]
pub struct PerfCounter {
    name: String,
    count: AtomicU64,
    total_nanos: AtomicU64,
}

impl PerfCounter {
    /// Create a new performance counter
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
        }
    }

    /// Record one timed operation
    pub fn record(&self, duration: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Counter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of recorded operations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean operation time in milliseconds
    pub fn average_millis(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.total_nanos.load(Ordering::Relaxed) as f64 / count as f64 / 1_000_000.0
    }

    /// Time a closure and record it
    pub fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.record(start.elapsed());
        result
    }
}
