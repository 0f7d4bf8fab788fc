//! Frame Statistics
//!
//! Duration of each feedback pass, with a rolling average for display.

use std::time::Duration;

use tessera_platform::{HighResTimer, RollingTimer};

/// Samples kept for the rolling average
const WINDOW: usize = 60;

/// Timing of feedback passes
#[derive(Debug)]
pub struct FrameStat {
    timer: HighResTimer,
    window: RollingTimer,
    last: Duration,
    frames: u64,
    running: bool,
}

impl FrameStat {
    /// Create an empty statistics window
    pub fn new() -> Self {
        Self {
            timer: HighResTimer::new(),
            window: RollingTimer::new(WINDOW),
            last: Duration::ZERO,
            frames: 0,
            running: false,
        }
    }

    /// Start timing a pass
    pub fn begin_frame(&mut self) {
        self.timer.reset();
        self.running = true;
    }

    /// Finish the pass started by [`FrameStat::begin_frame`]
    pub fn end_frame(&mut self) -> Duration {
        if !self.running {
            return Duration::ZERO;
        }
        self.running = false;

        self.last = self.timer.elapsed();
        self.window.record_duration(self.last);
        self.frames += 1;
        self.last
    }

    /// Passes timed so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Duration of the latest pass
    pub fn last(&self) -> Duration {
        self.last
    }

    /// Rolling average pass time in milliseconds
    pub fn average_millis(&self) -> f64 {
        self.window.average() * 1000.0
    }

    /// Slowest pass in the window, in milliseconds
    pub fn max_millis(&self) -> f64 {
        self.window.max() * 1000.0
    }
}

impl Default for FrameStat {
    fn default() -> Self {
        Self::new()
    }
}
