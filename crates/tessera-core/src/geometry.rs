//! Table-Space Geometry
//!
//! Rectangles in page-table cells, physical tile slots and virtual page
//! addresses.

use glam::UVec2;
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in finest page-table cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TableRect {
    /// Create a rectangle from its origin and extent
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Exclusive right edge
    pub fn x_max(&self) -> u32 {
        self.x + self.width
    }

    /// Exclusive bottom edge
    pub fn y_max(&self) -> u32 {
        self.y + self.height
    }

    /// Quadrant index (0..4, row-major) of the cell `(x, y)`
    ///
    /// Cells outside the rectangle are clamped into the nearest quadrant.
    pub fn quadrant(&self, x: u32, y: u32) -> usize {
        let half_w = self.width / 2;
        let half_h = self.height / 2;
        let right = x >= self.x + half_w;
        let bottom = y >= self.y + half_h;
        (bottom as usize) * 2 + right as usize
    }

    /// Split into four quadrants, row-major
    ///
    /// Odd extents give the extra cell to the right/bottom quadrants.
    pub fn split(&self) -> [TableRect; 4] {
        let half_w = self.width / 2;
        let half_h = self.height / 2;
        let rest_w = self.width - half_w;
        let rest_h = self.height - half_h;
        [
            TableRect::new(self.x, self.y, half_w, half_h),
            TableRect::new(self.x + half_w, self.y, rest_w, half_h),
            TableRect::new(self.x, self.y + half_h, half_w, rest_h),
            TableRect::new(self.x + half_w, self.y + half_h, rest_w, rest_h),
        ]
    }
}

/// Physical tile slot in the atlas grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileIndex {
    pub x: u32,
    pub y: u32,
}

impl TileIndex {
    /// Create a tile index
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Tile slot from a linear id in a grid `columns` wide
    pub fn from_id(id: u32, columns: u32) -> Self {
        Self {
            x: id % columns,
            y: id / columns,
        }
    }

    /// Linear id in a grid `columns` wide
    pub fn to_id(&self, columns: u32) -> u32 {
        self.y * columns + self.x
    }

    /// Texel origin of this slot in an atlas whose slots are `slot_size` wide
    pub fn texel_origin(&self, slot_size: u32) -> UVec2 {
        UVec2::new(self.x * slot_size, self.y * slot_size)
    }
}

/// Virtual page address: page coordinates at a mip level
///
/// `x` and `y` count pages of that mip level, so the same address always
/// names the same texels regardless of which cell asked for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageAddress {
    pub x: u32,
    pub y: u32,
    pub mip: u32,
}

impl PageAddress {
    /// Create a page address
    pub const fn new(x: u32, y: u32, mip: u32) -> Self {
        Self { x, y, mip }
    }
}

impl std::fmt::Display for PageAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}) @ mip {}", self.x, self.y, self.mip)
    }
}
