//! Tiled Texture
//!
//! The physical atlas: a fixed grid of padded tile slots replicated across
//! every texture layer, with slots recycled in least-recently-used order.
//!
//! Layer buffers live on the CPU. The renderer uploads the regions listed
//! by [`TiledTexture::take_dirty_tiles`].

use glam::{UVec2, Vec4};
use tessera_core::{FrameToken, LruCache, StreamingConfig, TileIndex};

use crate::VtResult;
use crate::source::LayerImage;

/// Texels of one atlas layer
#[derive(Debug, Clone)]
pub struct LayerBuffer {
    extent: UVec2,
    bytes_per_texel: u32,
    texels: Vec<u8>,
}

impl LayerBuffer {
    fn new(extent: UVec2, bytes_per_texel: u32) -> Self {
        let len = extent.x as usize * extent.y as usize * bytes_per_texel as usize;
        Self {
            extent,
            bytes_per_texel,
            texels: vec![0; len],
        }
    }

    /// Extent in texels
    pub fn extent(&self) -> UVec2 {
        self.extent
    }

    /// Bytes per texel
    pub fn bytes_per_texel(&self) -> u32 {
        self.bytes_per_texel
    }

    /// Raw texels, row-major
    pub fn as_bytes(&self) -> &[u8] {
        &self.texels
    }

    /// Texel bytes at `(x, y)`
    pub fn texel(&self, x: u32, y: u32) -> &[u8] {
        let bpt = self.bytes_per_texel as usize;
        let offset = (y as usize * self.extent.x as usize + x as usize) * bpt;
        &self.texels[offset..offset + bpt]
    }

    fn row_stride(&self) -> usize {
        self.extent.x as usize * self.bytes_per_texel as usize
    }
}

/// Raised by [`TiledTexture::update_tile`]
///
/// Whatever page was bound to `tile` before the update no longer owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileUpdated {
    pub tile: TileIndex,
    pub layers_written: u32,
}

/// Atlas counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TiledTextureStats {
    pub tiles_updated: u64,
    pub layers_written: u64,
    /// `None` layers left untouched
    pub layers_skipped: u64,
    /// Layers whose size did not match a slot
    pub rejected_layers: u64,
    /// Distinct tiles marked active in the most recent usage frame
    pub active_this_frame: u32,
    /// Slots handed out while still in use in the current usage frame
    pub evicted_while_active: u64,
}

/// Physical tile atlas
pub struct TiledTexture {
    region_size: UVec2,
    tile_size: u32,
    padding_size: u32,
    slot_size: u32,
    layers: Vec<LayerBuffer>,
    lru: LruCache,
    /// Last usage frame each slot was counted in
    usage: Vec<Option<FrameToken>>,
    usage_frame: Option<FrameToken>,
    dirty: Vec<TileIndex>,
    dirty_flags: Vec<bool>,
    stats: TiledTextureStats,
}

impl TiledTexture {
    /// Allocate an atlas shaped by `config`
    pub fn new(config: &StreamingConfig) -> VtResult<Self> {
        config.validate()?;

        let extent = config.atlas_extent();
        let tile_count = config.tile_count();
        let layers = (0..config.layer_count)
            .map(|_| LayerBuffer::new(extent, config.bytes_per_texel))
            .collect();

        log::debug!(
            "Allocated {}x{} tile atlas ({}x{} texels, {} layers)",
            config.region_size.x,
            config.region_size.y,
            extent.x,
            extent.y,
            config.layer_count
        );

        Ok(Self {
            region_size: config.region_size,
            tile_size: config.tile_size,
            padding_size: config.padding_size,
            slot_size: config.slot_size(),
            layers,
            lru: LruCache::new(tile_count),
            usage: vec![None; tile_count as usize],
            usage_frame: None,
            dirty: Vec::new(),
            dirty_flags: vec![false; tile_count as usize],
            stats: TiledTextureStats::default(),
        })
    }

    fn tile_id(&self, tile: TileIndex) -> Option<u32> {
        (tile.x < self.region_size.x && tile.y < self.region_size.y)
            .then(|| tile.to_id(self.region_size.x))
    }

    /// The least recently used slot, free for reuse
    ///
    /// Does not mark the slot as used.
    pub fn request_tile(&mut self) -> TileIndex {
        let id = self.lru.peek_oldest().unwrap_or(0);

        if self.usage_frame.is_some() && self.usage[id as usize] == self.usage_frame {
            self.stats.evicted_while_active += 1;
            log::debug!(
                "Reusing tile {} while it is active in frame {:?}",
                id,
                self.usage_frame
            );
        }

        TileIndex::from_id(id, self.region_size.x)
    }

    /// Mark a slot as used in `frame`
    ///
    /// Returns `false` for a slot outside the atlas.
    pub fn set_active(&mut self, tile: TileIndex, frame: FrameToken) -> bool {
        let Some(id) = self.tile_id(tile) else {
            return false;
        };

        if self.usage_frame != Some(frame) {
            self.usage_frame = Some(frame);
            self.stats.active_this_frame = 0;
        }
        if self.usage[id as usize] != Some(frame) {
            self.usage[id as usize] = Some(frame);
            self.stats.active_this_frame += 1;
        }

        self.lru.touch(id)
    }

    /// Copy fetched layers into a slot
    ///
    /// `None` layers keep their previous texels. A layer that is not exactly
    /// one padded slot in size is skipped with a warning.
    pub fn update_tile(&mut self, tile: TileIndex, layers: &[Option<LayerImage>]) -> TileUpdated {
        let mut written = 0;

        if let Some(id) = self.tile_id(tile) {
            self.lru.touch(id);

            for (index, layer) in layers.iter().enumerate() {
                let Some(image) = layer else {
                    self.stats.layers_skipped += 1;
                    continue;
                };

                if self.write_layer(index, tile, image) {
                    written += 1;
                } else {
                    self.stats.rejected_layers += 1;
                }
            }

            if written > 0 && !self.dirty_flags[id as usize] {
                self.dirty_flags[id as usize] = true;
                self.dirty.push(tile);
            }
            self.stats.tiles_updated += 1;
            self.stats.layers_written += u64::from(written);
        } else {
            log::warn!("Ignoring update of tile {:?} outside the atlas", tile);
        }

        TileUpdated {
            tile,
            layers_written: written,
        }
    }

    fn write_layer(&mut self, index: usize, tile: TileIndex, image: &LayerImage) -> bool {
        let slot = self.slot_size;
        let Some(buffer) = self.layers.get_mut(index) else {
            log::warn!("Tile {:?} has no layer {}", tile, index);
            return false;
        };

        if image.width != slot
            || image.height != slot
            || image.bytes_per_texel != buffer.bytes_per_texel
            || image.texels.len() != image.expected_len()
        {
            log::warn!(
                "Rejected layer {} for tile {:?}: {}x{} with {} bytes, slot is {}x{}",
                index,
                tile,
                image.width,
                image.height,
                image.texels.len(),
                slot,
                slot
            );
            return false;
        }

        let origin = tile.texel_origin(slot);
        let stride = buffer.row_stride();
        let bpt = buffer.bytes_per_texel as usize;
        let row_bytes = image.row_bytes();

        for (row, src) in image.texels.chunks_exact(row_bytes).enumerate() {
            let start = (origin.y as usize + row) * stride + origin.x as usize * bpt;
            buffer.texels[start..start + row_bytes].copy_from_slice(src);
        }
        true
    }

    /// One layer of the atlas
    pub fn layer(&self, index: usize) -> Option<&LayerBuffer> {
        self.layers.get(index)
    }

    /// Number of layers
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Atlas extent in tiles
    pub fn region_size(&self) -> UVec2 {
        self.region_size
    }

    /// Padded slot extent in texels
    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    /// Number of tile slots
    pub fn tile_count(&self) -> u32 {
        self.lru.capacity()
    }

    /// Usage order of the tile slots
    pub fn lru(&self) -> &LruCache {
        &self.lru
    }

    /// Slots written since the last [`TiledTexture::take_dirty_tiles`]
    pub fn dirty_tiles(&self) -> &[TileIndex] {
        &self.dirty
    }

    /// Take the list of written slots for upload
    pub fn take_dirty_tiles(&mut self) -> Vec<TileIndex> {
        self.dirty_flags.fill(false);
        std::mem::take(&mut self.dirty)
    }

    /// Shader-side remapping parameters
    ///
    /// `(padding / slot, tile / slot, 1 / columns, 1 / rows)`
    pub fn atlas_params(&self) -> Vec4 {
        let slot = self.slot_size as f32;
        Vec4::new(
            self.padding_size as f32 / slot,
            self.tile_size as f32 / slot,
            1.0 / self.region_size.x as f32,
            1.0 / self.region_size.y as f32,
        )
    }

    /// Upload counters
    pub fn stats(&self) -> &TiledTextureStats {
        &self.stats
    }
}
