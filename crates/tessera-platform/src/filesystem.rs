//! File System Abstraction
//!
//! On-disk layout of a baked virtual texture.
//!
//! Every page layer is one raw file of texels:
//! `<root>/layer<L>/mip<M>/<x>_<y>.tile`

use std::path::{Path, PathBuf};

use tessera_core::PageAddress;

use crate::{PlatformError, PlatformResult};

/// File extension of raw tile files
pub const TILE_EXTENSION: &str = "tile";

/// Directory of raw tile files
#[derive(Debug, Clone)]
pub struct TileStore {
    root: PathBuf,
    /// Expected byte length of every tile file
    tile_bytes: usize,
}

impl TileStore {
    /// Open a tile store rooted at `root`
    pub fn new(root: impl Into<PathBuf>, tile_bytes: usize) -> Self {
        Self {
            root: root.into(),
            tile_bytes,
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of one page layer
    pub fn tile_path(&self, page: PageAddress, layer: u32) -> PathBuf {
        self.root
            .join(format!("layer{}", layer))
            .join(format!("mip{}", page.mip))
            .join(format!("{}_{}.{}", page.x, page.y, TILE_EXTENSION))
    }

    /// Read one page layer
    ///
    /// A missing file surfaces as `PlatformError::FileIO` with
    /// `ErrorKind::NotFound`.
    pub fn read_tile(&self, page: PageAddress, layer: u32) -> PlatformResult<Vec<u8>> {
        let path = self.tile_path(page, layer);
        let data = std::fs::read(&path)?;

        if data.len() != self.tile_bytes {
            return Err(PlatformError::TileSizeMismatch {
                path: path.display().to_string(),
                expected: self.tile_bytes,
                actual: data.len(),
            });
        }

        Ok(data)
    }

    /// Write one page layer, creating directories as needed
    pub fn write_tile(&self, page: PageAddress, layer: u32, data: &[u8]) -> PlatformResult<()> {
        if data.len() != self.tile_bytes {
            return Err(PlatformError::TileSizeMismatch {
                path: self.tile_path(page, layer).display().to_string(),
                expected: self.tile_bytes,
                actual: data.len(),
            });
        }

        let path = self.tile_path(page, layer);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)?;
        Ok(())
    }

    /// Count the tile files stored for a layer and mip level
    pub fn count_tiles(&self, layer: u32, mip: u32) -> PlatformResult<usize> {
        let dir = self.root.join(format!("layer{}", layer)).join(format!("mip{}", mip));
        if !dir.is_dir() {
            return Ok(0);
        }

        let mut count = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == TILE_EXTENSION) {
                count += 1;
            }
        }
        Ok(count)
    }
}
