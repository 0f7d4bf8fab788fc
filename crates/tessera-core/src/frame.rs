//! Frame Tokens
//!
//! Every per-frame operation takes the frame it runs in as an explicit
//! argument instead of reading a global counter.

use serde::{Deserialize, Serialize};

/// Monotonic frame identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct FrameToken(pub u64);

impl FrameToken {
    /// The frame after this one
    pub fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Low byte of the frame number, as stored in 8-bit texel channels
    pub fn stamp(&self) -> u8 {
        self.0 as u8
    }
}

impl std::fmt::Display for FrameToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Source of consecutive frame tokens
#[derive(Debug, Clone, Default)]
pub struct FrameClock {
    current: FrameToken,
}

impl FrameClock {
    /// Create a clock positioned before the first frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Current frame
    pub fn current(&self) -> FrameToken {
        self.current
    }

    /// Move to the next frame and return it
    pub fn advance(&mut self) -> FrameToken {
        self.current = self.current.next();
        self.current
    }
}
