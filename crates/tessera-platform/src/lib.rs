//! # Tessera Platform
//!
//! Platform services for the Tessera virtual texture streamer.
//!
//! This crate provides:
//! - **Threading**: The worker pool tile fetches run on
//! - **FileSystem**: The on-disk tile store layout
//! - **Timers**: High-resolution timers and rolling statistics

pub mod filesystem;
pub mod threading;
pub mod timer;

pub use filesystem::TileStore;
pub use threading::ThreadPool;
pub use timer::{HighResTimer, PerfCounter, RollingTimer, ScopedTimer};

use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("File I/O error: {0}")]
    FileIO(#[from] std::io::Error),

    #[error("Tile file {path} has {actual} bytes, expected {expected}")]
    TileSizeMismatch {
        path: String,
        expected: usize,
        actual: usize,
    },

    #[error("Thread spawn failed: {0}")]
    ThreadSpawn(String),
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;
