//! # Tessera Core
//!
//! Core types for the Tessera virtual texture streamer.
//!
//! This crate provides the building blocks shared by the streaming crates:
//! - **Config**: `StreamingConfig`, the handful of integers an atlas is built from
//! - **LRU**: Fixed-pool least-recently-used ordering of physical tile slots
//! - **Frame**: Explicit frame tokens passed into every per-frame operation
//! - **Geometry**: Table-space rectangles, tile slots and page addresses

pub mod frame;
pub mod geometry;
pub mod lru;

pub use frame::{FrameClock, FrameToken};
pub use geometry::{PageAddress, TableRect, TileIndex};
pub use lru::LruCache;

use glam::UVec2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest table or region extent addressable with 8-bit texel channels
pub const MAX_BYTE_EXTENT: u32 = 256;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Table size must be a power of two in 1..=256, got {0}")]
    InvalidTableSize(u32),

    #[error("Region size {0}x{1} must be within 1..=256 tiles per side")]
    InvalidRegionSize(u32, u32),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Order in which the loader services its pending queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DispatchOrder {
    /// Highest mip level (coarsest page) first
    #[default]
    CoarsestFirst,
    /// Lowest mip level (most detailed page) first
    FinestFirst,
}

/// Streaming configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Page table extent in finest cells per side (power of two)
    pub table_size: u32,
    /// Upper bound on the page table depth
    pub mip_level_limit: u32,
    /// Physical atlas extent in tiles (columns, rows)
    pub region_size: UVec2,
    /// Usable tile extent in texels
    pub tile_size: u32,
    /// Border texels on every side of a tile
    pub padding_size: u32,
    /// Number of parallel texture layers (albedo, normal, ...)
    pub layer_count: u32,
    /// Bytes per texel in every layer
    pub bytes_per_texel: u32,
    /// Maximum number of tile fetches in flight
    pub thread_limit: u32,
    /// Feedback target resolution relative to the screen
    pub readback_scale: f32,
    /// Maximum number of outstanding feedback readbacks
    pub max_pending_readbacks: usize,
    /// Loader queue policy
    pub dispatch_order: DispatchOrder,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            table_size: 256,
            mip_level_limit: 8,
            region_size: UVec2::new(16, 16),
            tile_size: 128,
            padding_size: 4,
            layer_count: 2,
            bytes_per_texel: 4,
            thread_limit: 4,
            readback_scale: 0.25,
            max_pending_readbacks: 8,
            dispatch_order: DispatchOrder::CoarsestFirst,
        }
    }
}

impl StreamingConfig {
    /// A tiny configuration useful for tests and demos
    pub fn small() -> Self {
        Self {
            table_size: 8,
            mip_level_limit: 3,
            region_size: UVec2::new(2, 2),
            tile_size: 4,
            padding_size: 1,
            layer_count: 2,
            bytes_per_texel: 4,
            thread_limit: 2,
            readback_scale: 1.0,
            max_pending_readbacks: 8,
            dispatch_order: DispatchOrder::CoarsestFirst,
        }
    }

    /// Deepest mip level the page table uses
    pub fn max_mip_level(&self) -> u32 {
        self.mip_level_limit.min(self.table_size.trailing_zeros())
    }

    /// Tile extent including padding on both sides
    pub fn slot_size(&self) -> u32 {
        self.tile_size + 2 * self.padding_size
    }

    /// Number of physical tile slots in the atlas
    pub fn tile_count(&self) -> u32 {
        self.region_size.x * self.region_size.y
    }

    /// Physical atlas extent in texels
    pub fn atlas_extent(&self) -> UVec2 {
        self.region_size * self.slot_size()
    }

    /// Bytes held by one layer of the physical atlas
    pub fn layer_bytes(&self) -> usize {
        let extent = self.atlas_extent();
        extent.x as usize * extent.y as usize * self.bytes_per_texel as usize
    }

    /// Check that the configuration describes a usable atlas
    pub fn validate(&self) -> CoreResult<()> {
        if self.table_size == 0
            || !self.table_size.is_power_of_two()
            || self.table_size > MAX_BYTE_EXTENT
        {
            return Err(CoreError::InvalidTableSize(self.table_size));
        }

        let region = self.region_size;
        if region.x == 0 || region.y == 0 || region.x > MAX_BYTE_EXTENT || region.y > MAX_BYTE_EXTENT {
            return Err(CoreError::InvalidRegionSize(region.x, region.y));
        }

        if self.tile_size == 0 {
            return Err(CoreError::InvalidConfig("tile_size must be non-zero".into()));
        }
        if self.layer_count == 0 {
            return Err(CoreError::InvalidConfig("layer_count must be non-zero".into()));
        }
        if self.bytes_per_texel == 0 {
            return Err(CoreError::InvalidConfig("bytes_per_texel must be non-zero".into()));
        }
        if self.thread_limit == 0 {
            return Err(CoreError::InvalidConfig("thread_limit must be non-zero".into()));
        }
        if self.max_pending_readbacks == 0 {
            return Err(CoreError::InvalidConfig(
                "max_pending_readbacks must be non-zero".into(),
            ));
        }
        if !(self.readback_scale > 0.0 && self.readback_scale <= 1.0) {
            return Err(CoreError::InvalidConfig(format!(
                "readback_scale must be in (0, 1], got {}",
                self.readback_scale
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StreamingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_mip_level(), 8);
        assert_eq!(config.slot_size(), 136);
        assert_eq!(config.tile_count(), 256);
    }

    #[test]
    fn test_max_mip_level_is_clamped_by_table_size() {
        let mut config = StreamingConfig::small();
        assert_eq!(config.max_mip_level(), 3);

        config.mip_level_limit = 10;
        assert_eq!(config.max_mip_level(), 3);

        config.mip_level_limit = 1;
        assert_eq!(config.max_mip_level(), 1);
    }

    #[test]
    fn test_rejects_non_power_of_two_table() {
        let mut config = StreamingConfig::small();
        config.table_size = 12;
        assert_eq!(config.validate(), Err(CoreError::InvalidTableSize(12)));

        config.table_size = 512;
        assert_eq!(config.validate(), Err(CoreError::InvalidTableSize(512)));
    }

    #[test]
    fn test_rejects_bad_region_and_scale() {
        let mut config = StreamingConfig::small();
        config.region_size = UVec2::new(0, 4);
        assert_eq!(config.validate(), Err(CoreError::InvalidRegionSize(0, 4)));

        let mut config = StreamingConfig::small();
        config.readback_scale = 0.0;
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_atlas_extent() {
        let config = StreamingConfig::small();
        assert_eq!(config.atlas_extent(), UVec2::new(12, 12));
        assert_eq!(config.layer_bytes(), 12 * 12 * 4);
    }

    #[test]
    fn test_config_json_defaults_missing_fields() {
        let config: StreamingConfig = serde_json::from_str(r#"{ "table_size": 64 }"#).unwrap();
        assert_eq!(config.table_size, 64);
        assert_eq!(config.tile_size, StreamingConfig::default().tile_size);
        assert_eq!(config.dispatch_order, DispatchOrder::CoarsestFirst);
    }
}
