//! Tile Sources
//!
//! Where page texels come from. A source answers one `(page, layer)` at a
//! time and is called from fetch worker threads.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::RwLock;
use tessera_core::{PageAddress, StreamingConfig};
use tessera_platform::{PlatformError, TileStore};
use thiserror::Error;

/// Tile fetch errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Page layer not found")]
    Missing,

    #[error("Corrupt page layer: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tile source unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    /// Whether the error fails the whole request rather than one layer
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

impl From<PlatformError> for SourceError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::FileIO(e) if e.kind() == std::io::ErrorKind::NotFound => {
                SourceError::Missing
            }
            PlatformError::FileIO(e) => SourceError::Io(e),
            e @ PlatformError::TileSizeMismatch { .. } => SourceError::Corrupt(e.to_string()),
            PlatformError::ThreadSpawn(e) => SourceError::Unavailable(e),
        }
    }
}

/// Decoded texels of one page layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerImage {
    pub width: u32,
    pub height: u32,
    pub bytes_per_texel: u32,
    pub texels: Vec<u8>,
}

impl LayerImage {
    /// Wrap raw texels
    pub fn new(width: u32, height: u32, bytes_per_texel: u32, texels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            bytes_per_texel,
            texels,
        }
    }

    /// Image with every texel set to `texel`
    ///
    /// `texel` is repeated or truncated to `bytes_per_texel` bytes.
    pub fn filled(width: u32, height: u32, bytes_per_texel: u32, texel: &[u8]) -> Self {
        let texel: Vec<u8> = texel.iter().copied().cycle().take(bytes_per_texel as usize).collect();
        let texels = texel.repeat(width as usize * height as usize);
        Self::new(width, height, bytes_per_texel, texels)
    }

    /// Byte length implied by the dimensions
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_texel as usize
    }

    /// Bytes of one row
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.bytes_per_texel as usize
    }

    /// Texel bytes at `(x, y)`
    pub fn texel(&self, x: u32, y: u32) -> &[u8] {
        let bpt = self.bytes_per_texel as usize;
        let offset = (y as usize * self.width as usize + x as usize) * bpt;
        &self.texels[offset..offset + bpt]
    }
}

/// Pull interface for page texels
pub trait TileSource: Send + Sync {
    /// Fetch one layer of one page
    fn fetch_layer(&self, page: PageAddress, layer: u32) -> Result<LayerImage, SourceError>;

    /// Name used in log messages
    fn name(&self) -> &str {
        "tile_source"
    }
}

/// In-memory tile source
pub struct MemoryTileSource {
    tiles: RwLock<AHashMap<(PageAddress, u32), LayerImage>>,
    offline: AtomicBool,
    fetches: AtomicU64,
}

impl MemoryTileSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self {
            tiles: RwLock::new(AHashMap::new()),
            offline: AtomicBool::new(false),
            fetches: AtomicU64::new(0),
        }
    }

    /// Store one page layer
    pub fn insert(&self, page: PageAddress, layer: u32, image: LayerImage) {
        self.tiles.write().insert((page, layer), image);
    }

    /// Make every fetch fail with `SourceError::Unavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Number of `fetch_layer` calls served so far
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Number of stored page layers
    pub fn len(&self) -> usize {
        self.tiles.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.tiles.read().is_empty()
    }
}

impl Default for MemoryTileSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TileSource for MemoryTileSource {
    fn fetch_layer(&self, page: PageAddress, layer: u32) -> Result<LayerImage, SourceError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);

        if self.offline.load(Ordering::Relaxed) {
            return Err(SourceError::Unavailable("memory source is offline".into()));
        }

        self.tiles
            .read()
            .get(&(page, layer))
            .cloned()
            .ok_or(SourceError::Missing)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Generates a deterministic test pattern for every page
///
/// Each texel encodes its position within the page, the page coordinates,
/// the mip level and the layer, so uploads can be checked texel by texel.
#[derive(Debug, Clone)]
pub struct ProceduralTileSource {
    slot_size: u32,
    bytes_per_texel: u32,
    max_mip_level: u32,
}

impl ProceduralTileSource {
    /// Create a source producing padded tiles for `config`
    pub fn new(config: &StreamingConfig) -> Self {
        Self {
            slot_size: config.slot_size(),
            bytes_per_texel: config.bytes_per_texel,
            max_mip_level: config.max_mip_level(),
        }
    }

    /// Pattern value of one texel
    pub fn texel_value(page: PageAddress, layer: u32, x: u32, y: u32) -> [u8; 4] {
        let checker = if ((x / 4) + (y / 4)) % 2 == 0 { 0xff } else { 0x40 };
        [
            (page.x as u8).wrapping_mul(16).wrapping_add(x as u8),
            (page.y as u8).wrapping_mul(16).wrapping_add(y as u8),
            (page.mip as u8).wrapping_mul(32).wrapping_add(layer as u8),
            checker,
        ]
    }
}

impl TileSource for ProceduralTileSource {
    fn fetch_layer(&self, page: PageAddress, layer: u32) -> Result<LayerImage, SourceError> {
        if page.mip > self.max_mip_level {
            return Err(SourceError::Missing);
        }

        let bpt = self.bytes_per_texel as usize;
        let size = self.slot_size;
        let mut texels = Vec::with_capacity(size as usize * size as usize * bpt);
        for y in 0..size {
            for x in 0..size {
                let value = Self::texel_value(page, layer, x, y);
                texels.extend(value.iter().copied().cycle().take(bpt));
            }
        }

        Ok(LayerImage::new(size, size, self.bytes_per_texel, texels))
    }

    fn name(&self) -> &str {
        "procedural"
    }
}

/// Reads page layers baked into a `TileStore`
#[derive(Debug, Clone)]
pub struct FileTileSource {
    store: TileStore,
    slot_size: u32,
    bytes_per_texel: u32,
}

impl FileTileSource {
    /// Open a baked store at `root` for tiles shaped by `config`
    pub fn new(root: impl Into<std::path::PathBuf>, config: &StreamingConfig) -> Self {
        let slot = config.slot_size() as usize;
        let tile_bytes = slot * slot * config.bytes_per_texel as usize;
        Self {
            store: TileStore::new(root, tile_bytes),
            slot_size: config.slot_size(),
            bytes_per_texel: config.bytes_per_texel,
        }
    }

    /// Underlying store
    pub fn store(&self) -> &TileStore {
        &self.store
    }
}

impl TileSource for FileTileSource {
    fn fetch_layer(&self, page: PageAddress, layer: u32) -> Result<LayerImage, SourceError> {
        if !self.store.root().is_dir() {
            return Err(SourceError::Unavailable(format!(
                "tile store {} does not exist",
                self.store.root().display()
            )));
        }

        let texels = self.store.read_tile(page, layer)?;
        Ok(LayerImage::new(
            self.slot_size,
            self.slot_size,
            self.bytes_per_texel,
            texels,
        ))
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filled_image() {
        let image = LayerImage::filled(2, 3, 4, &[1, 2]);
        assert_eq!(image.texels.len(), image.expected_len());
        assert_eq!(image.texel(1, 2), &[1, 2, 1, 2]);
        assert_eq!(image.row_bytes(), 8);
    }

    #[test]
    fn test_memory_source() {
        let source = MemoryTileSource::new();
        let page = PageAddress::new(0, 0, 3);
        source.insert(page, 0, LayerImage::filled(1, 1, 4, &[9]));

        assert_eq!(source.fetch_layer(page, 0).unwrap().texels, vec![9, 9, 9, 9]);
        assert!(matches!(source.fetch_layer(page, 1), Err(SourceError::Missing)));
        assert_eq!(source.fetch_count(), 2);
        assert_eq!(source.len(), 1);

        source.set_offline(true);
        let err = source.fetch_layer(page, 0).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_procedural_source_is_deterministic() {
        let config = StreamingConfig::small();
        let source = ProceduralTileSource::new(&config);
        let page = PageAddress::new(1, 0, 2);

        let a = source.fetch_layer(page, 0).unwrap();
        let b = source.fetch_layer(page, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.width, config.slot_size());
        assert_eq!(a.texels.len(), a.expected_len());
        assert_eq!(a.texel(3, 1), &ProceduralTileSource::texel_value(page, 0, 3, 1));

        let other_layer = source.fetch_layer(page, 1).unwrap();
        assert_ne!(a, other_layer);

        assert!(matches!(
            source.fetch_layer(PageAddress::new(0, 0, 9), 0),
            Err(SourceError::Missing)
        ));
    }

    #[test]
    fn test_file_source() {
        let config = StreamingConfig::small();
        let dir = std::env::temp_dir().join(format!("tessera_file_source_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let source = FileTileSource::new(&dir, &config);
        let page = PageAddress::new(0, 0, 3);
        assert!(source.fetch_layer(page, 0).unwrap_err().is_fatal());

        let procedural = ProceduralTileSource::new(&config);
        let image = procedural.fetch_layer(page, 0).unwrap();
        source.store().write_tile(page, 0, &image.texels).unwrap();

        assert_eq!(source.fetch_layer(page, 0).unwrap(), image);
        assert!(matches!(source.fetch_layer(page, 1), Err(SourceError::Missing)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_platform_error_mapping() {
        let missing: SourceError =
            PlatformError::FileIO(std::io::Error::from(std::io::ErrorKind::NotFound)).into();
        assert!(matches!(missing, SourceError::Missing));

        let corrupt: SourceError = PlatformError::TileSizeMismatch {
            path: "x".into(),
            expected: 4,
            actual: 2,
        }
        .into();
        assert!(matches!(corrupt, SourceError::Corrupt(_)));
        assert!(!corrupt.is_fatal());
    }
}
