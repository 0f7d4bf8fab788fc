//! Feedback Readback
//!
//! The renderer draws the scene into a small off-screen target where every
//! pixel names the page it wants: `(table_x, table_y, mip, frame_stamp)`.
//! That target reaches the CPU asynchronously a few frames later.
//!
//! [`FeedbackReader`] keeps the outstanding readbacks in submission order
//! and only ever looks at the oldest one, so images are processed in the
//! order they were rendered.

use std::collections::VecDeque;

use glam::UVec2;

use crate::{VtError, VtResult};

/// CPU copy of one feedback pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackImage {
    width: u32,
    height: u32,
    pixels: Vec<[u8; 4]>,
}

impl FeedbackImage {
    /// Wrap `width * height` pixels, row-major
    pub fn new(width: u32, height: u32, pixels: Vec<[u8; 4]>) -> VtResult<Self> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(VtError::FeedbackSize {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self { width, height, pixels })
    }

    /// Decode tightly packed RGB8 bytes; the stamp channel is zero
    pub fn from_rgb(width: u32, height: u32, bytes: &[u8]) -> VtResult<Self> {
        let expected = width as usize * height as usize * 3;
        if bytes.len() != expected {
            return Err(VtError::FeedbackSize {
                expected,
                actual: bytes.len(),
            });
        }
        let pixels = bytes.chunks_exact(3).map(|c| [c[0], c[1], c[2], 0]).collect();
        Self::new(width, height, pixels)
    }

    /// Decode tightly packed RGBA8 bytes
    pub fn from_rgba(width: u32, height: u32, bytes: &[u8]) -> VtResult<Self> {
        let expected = width as usize * height as usize * 4;
        if bytes.len() != expected {
            return Err(VtError::FeedbackSize {
                expected,
                actual: bytes.len(),
            });
        }
        let pixels = bytes
            .chunks_exact(4)
            .map(|c| [c[0], c[1], c[2], c[3]])
            .collect();
        Self::new(width, height, pixels)
    }

    /// Every pixel set to `pixel`
    pub fn filled(width: u32, height: u32, pixel: [u8; 4]) -> Self {
        Self {
            width,
            height,
            pixels: vec![pixel; width as usize * height as usize],
        }
    }

    /// Pixel `(x, y)` computed by `f`
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> [u8; 4]) -> Self {
        let pixels = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| f(x, y))
            .collect();
        Self { width, height, pixels }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixels, row-major
    pub fn pixels(&self) -> &[[u8; 4]] {
        &self.pixels
    }
}

/// State of an asynchronous readback
#[derive(Debug)]
pub enum ReadbackStatus {
    Pending,
    Ready(FeedbackImage),
    Failed(String),
}

/// GPU to CPU copy of a feedback target
pub trait ReadbackRequest: Send {
    /// Check for completion; a request is not polled again after it
    /// returns `Ready` or `Failed`
    fn poll(&mut self) -> ReadbackStatus;
}

/// Readback that becomes available after a fixed number of polls
#[derive(Debug)]
pub struct DelayedReadback {
    image: Option<FeedbackImage>,
    remaining: u32,
    failure: Option<String>,
}

impl DelayedReadback {
    /// Ready on the poll after `latency` pending polls
    pub fn new(image: FeedbackImage, latency: u32) -> Self {
        Self {
            image: Some(image),
            remaining: latency,
            failure: None,
        }
    }

    /// Fails after `latency` pending polls
    pub fn failing(message: impl Into<String>, latency: u32) -> Self {
        Self {
            image: None,
            remaining: latency,
            failure: Some(message.into()),
        }
    }
}

impl ReadbackRequest for DelayedReadback {
    fn poll(&mut self) -> ReadbackStatus {
        if self.remaining > 0 {
            self.remaining -= 1;
            return ReadbackStatus::Pending;
        }

        if let Some(message) = self.failure.take() {
            return ReadbackStatus::Failed(message);
        }
        match self.image.take() {
            Some(image) => ReadbackStatus::Ready(image),
            None => ReadbackStatus::Failed("readback already consumed".into()),
        }
    }
}

/// Readback counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackStats {
    pub submitted: u64,
    /// Submissions refused because the queue was full
    pub dropped: u64,
    pub completed: u64,
    pub failed: u64,
}

/// FIFO of outstanding feedback readbacks
pub struct FeedbackReader {
    queue: VecDeque<Box<dyn ReadbackRequest>>,
    max_pending: usize,
    stats: FeedbackStats,
}

impl FeedbackReader {
    /// Create a reader holding at most `max_pending` readbacks
    pub fn new(max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            queue: VecDeque::with_capacity(max_pending),
            max_pending,
            stats: FeedbackStats::default(),
        }
    }

    /// Queue a readback
    ///
    /// Returns `false` and drops the request when the queue is full.
    pub fn submit(&mut self, request: Box<dyn ReadbackRequest>) -> bool {
        if self.queue.len() >= self.max_pending {
            self.stats.dropped += 1;
            log::warn!(
                "Dropping feedback readback, {} already outstanding",
                self.queue.len()
            );
            return false;
        }

        self.queue.push_back(request);
        self.stats.submitted += 1;
        true
    }

    /// Take every finished readback from the front of the queue
    ///
    /// Stops at the first readback that is still pending. Failed readbacks
    /// are discarded.
    pub fn drain(&mut self) -> Vec<FeedbackImage> {
        let mut images = Vec::new();

        while let Some(front) = self.queue.front_mut() {
            match front.poll() {
                ReadbackStatus::Pending => break,
                ReadbackStatus::Ready(image) => {
                    self.stats.completed += 1;
                    images.push(image);
                }
                ReadbackStatus::Failed(message) => {
                    self.stats.failed += 1;
                    log::warn!("Feedback readback failed: {}", message);
                }
            }
            self.queue.pop_front();
        }

        images
    }

    /// Outstanding readbacks
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Queue capacity
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Submission and readback counters
    pub fn stats(&self) -> &FeedbackStats {
        &self.stats
    }
}

/// Feedback target extent for a screen of `screen` pixels
pub fn feedback_extent(screen: UVec2, readback_scale: f32) -> UVec2 {
    (screen.as_vec2() * readback_scale).as_uvec2().max(UVec2::ONE)
}
