//! Indirection Buffer
//!
//! One RGBA8 texel per finest page-table cell telling the renderer which
//! atlas slot holds that cell's texels and at what mip level:
//! `(tile_x, tile_y, mip, frame_stamp)`.
//!
//! Within one frame the most detailed page wins a cell. Across frames the
//! last writer wins. Frames are compared on a full-width epoch kept next to
//! each texel, so the 8-bit stamp wrapping around never makes an old entry
//! look current.

use tessera_core::{FrameToken, TableRect, TileIndex};

/// Decoded indirection texel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndirectionEntry {
    pub tile_x: u8,
    pub tile_y: u8,
    pub mip: u8,
    pub stamp: u8,
}

impl IndirectionEntry {
    /// Entry for `tile` at `mip`, written in `frame`
    pub fn new(tile: TileIndex, mip: u32, frame: FrameToken) -> Self {
        Self {
            tile_x: tile.x as u8,
            tile_y: tile.y as u8,
            mip: mip as u8,
            stamp: frame.stamp(),
        }
    }

    /// Texel bytes
    pub fn to_texel(self) -> [u8; 4] {
        [self.tile_x, self.tile_y, self.mip, self.stamp]
    }

    /// Decode texel bytes
    pub fn from_texel(texel: [u8; 4]) -> Self {
        Self {
            tile_x: texel[0],
            tile_y: texel[1],
            mip: texel[2],
            stamp: texel[3],
        }
    }

    /// Atlas slot
    pub fn tile(&self) -> TileIndex {
        TileIndex::new(u32::from(self.tile_x), u32::from(self.tile_y))
    }
}

/// CPU copy of the page-table lookup texture
#[derive(Debug, Clone)]
pub struct IndirectionBuffer {
    size: u32,
    texels: Vec<[u8; 4]>,
    epochs: Vec<Option<FrameToken>>,
}

impl IndirectionBuffer {
    /// Zeroed `size x size` buffer
    pub fn new(size: u32) -> Self {
        let cells = size as usize * size as usize;
        Self {
            size,
            texels: vec![[0; 4]; cells],
            epochs: vec![None; cells],
        }
    }

    /// Extent in cells per side
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Write a resident page into every cell its rectangle covers
    ///
    /// A cell already holding a more detailed page written in the same
    /// frame is left alone. Returns the number of cells written.
    pub fn write_node(&mut self, rect: TableRect, tile: TileIndex, mip: u32, frame: FrameToken) -> u32 {
        let texel = IndirectionEntry::new(tile, mip, frame).to_texel();
        let x_max = rect.x_max().min(self.size);
        let y_max = rect.y_max().min(self.size);
        let mut written = 0;

        for y in rect.y..y_max {
            let row = y as usize * self.size as usize;
            for x in rect.x..x_max {
                let index = row + x as usize;
                let same_frame = self.epochs[index] == Some(frame);
                if !same_frame || self.texels[index][2] > texel[2] {
                    self.texels[index] = texel;
                    self.epochs[index] = Some(frame);
                    written += 1;
                }
            }
        }

        written
    }

    /// Entry at cell `(x, y)`
    pub fn texel(&self, x: u32, y: u32) -> IndirectionEntry {
        IndirectionEntry::from_texel(self.texels[(y * self.size + x) as usize])
    }

    /// Frame that last wrote cell `(x, y)`
    pub fn epoch(&self, x: u32, y: u32) -> Option<FrameToken> {
        self.epochs[(y * self.size + x) as usize]
    }

    /// Raw RGBA8 texels for upload
    pub fn as_bytes(&self) -> &[u8] {
        self.texels.as_flattened()
    }
}
