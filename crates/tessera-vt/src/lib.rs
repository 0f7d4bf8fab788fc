//! # Tessera VT
//!
//! Virtual texture paging for the Tessera streamer.
//!
//! A very large logical texture is split into pages addressed by a
//! quadtree. Only the pages the current view asks for are fetched, and
//! they are packed into a small fixed atlas whose slots are recycled in
//! least-recently-used order.
//!
//! ## Features
//! - Lazy quadtree page table with one-level-per-frame promotion
//! - Padded multi-layer tile atlas
//! - De-duplicating loader with a bounded fetch window
//! - FIFO feedback readback with a bounded queue
//! - Indirection buffer ready for upload

pub mod feedback;
pub mod indirection;
pub mod loader;
pub mod page_table;
pub mod source;
pub mod stats;
pub mod tiled_texture;

pub use feedback::{DelayedReadback, FeedbackImage, FeedbackReader, ReadbackRequest, ReadbackStatus};
pub use indirection::{IndirectionBuffer, IndirectionEntry};
pub use loader::{FetchExecutor, InlineExecutor, LoadCompletion, LoadRequest, LoadRequester, Loader};
pub use page_table::{CompletionOutcome, NodeId, PageTable, TableNode};
pub use source::{FileTileSource, LayerImage, MemoryTileSource, ProceduralTileSource, SourceError, TileSource};
pub use stats::FrameStat;
pub use tiled_texture::TiledTexture;

use std::sync::Arc;
use std::time::Duration;

use glam::Vec4;
use tessera_core::{CoreError, FrameToken, StreamingConfig};
use tessera_platform::{PlatformError, ThreadPool};
use thiserror::Error;

/// Virtual texturing errors
#[derive(Error, Debug)]
pub enum VtError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] CoreError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Feedback buffer has {actual} elements, expected {expected}")]
    FeedbackSize { expected: usize, actual: usize },
}

/// Result type for virtual texturing operations
pub type VtResult<T> = Result<T, VtError>;

/// What one update did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub frame: FrameToken,
    pub completions_applied: usize,
    /// Stale or failed completions
    pub completions_dropped: usize,
    pub dispatched: usize,
    pub feedback_passes: usize,
    pub activations: usize,
    pub cells_written: u32,
    /// The indirection buffer changed and should be uploaded
    pub indirection_dirty: bool,
}

/// A complete virtual texture: page table, atlas, loader and feedback
/// reader driven from one update thread
pub struct VirtualTexture {
    config: StreamingConfig,
    page_table: PageTable,
    atlas: TiledTexture,
    loader: Loader,
    reader: FeedbackReader,
    indirection: IndirectionBuffer,
    frame_stat: FrameStat,
}

impl VirtualTexture {
    /// Build a virtual texture fetching from `source` on `executor`
    pub fn new(
        config: StreamingConfig,
        source: Arc<dyn TileSource>,
        executor: Box<dyn FetchExecutor>,
    ) -> VtResult<Self> {
        config.validate()?;

        log::info!(
            "Virtual texture: {}x{} table, {} mips, {}x{} atlas of {} texel tiles",
            config.table_size,
            config.table_size,
            config.max_mip_level() + 1,
            config.region_size.x,
            config.region_size.y,
            config.tile_size
        );

        Ok(Self {
            page_table: PageTable::new(&config)?,
            atlas: TiledTexture::new(&config)?,
            loader: Loader::new(&config, source, executor)?,
            reader: FeedbackReader::new(config.max_pending_readbacks),
            indirection: IndirectionBuffer::new(config.table_size),
            frame_stat: FrameStat::new(),
            config,
        })
    }

    /// Build a virtual texture fetching on `thread_limit` worker threads
    pub fn with_thread_pool(config: StreamingConfig, source: Arc<dyn TileSource>) -> VtResult<Self> {
        let pool = ThreadPool::new("tile-fetch", config.thread_limit as usize)?;
        log::debug!("Fetching on {} worker threads", pool.num_workers());
        Self::new(config, source, Box::new(pool))
    }

    /// Queue a feedback readback
    ///
    /// Returns `false` if too many readbacks are already outstanding.
    pub fn submit_feedback(&mut self, request: Box<dyn ReadbackRequest>) -> bool {
        self.reader.submit(request)
    }

    /// Run one frame
    ///
    /// Installs finished loads, refills the fetch window, then processes
    /// every feedback image that has arrived, in order.
    pub fn update(&mut self, frame: FrameToken) -> FrameReport {
        let mut report = FrameReport {
            frame,
            ..FrameReport::default()
        };

        for completion in self.loader.poll() {
            match self.page_table.on_load_complete(completion, &mut self.atlas) {
                CompletionOutcome::Applied { .. } => report.completions_applied += 1,
                CompletionOutcome::Stale | CompletionOutcome::Failed { .. } => {
                    report.completions_dropped += 1
                }
            }
        }

        report.dispatched = self.loader.dispatch();

        for image in self.reader.drain() {
            self.frame_stat.begin_frame();
            let outcome = self.page_table.process_feedback(
                &image,
                frame,
                &mut self.loader,
                &mut self.atlas,
                &mut self.indirection,
            );
            self.frame_stat.end_frame();

            report.feedback_passes += 1;
            report.activations += outcome.activations;
            report.cells_written += outcome.cells_written;
        }

        report.indirection_dirty = report.cells_written > 0;
        report
    }

    /// Block until a fetch finishes or `timeout` passes
    pub fn wait_for_loads(&mut self, timeout: Duration) -> bool {
        self.loader.wait_for_completion(timeout)
    }

    /// No loads outstanding and no readbacks queued
    pub fn is_settled(&self) -> bool {
        self.loader.is_idle() && self.reader.pending_count() == 0
    }

    /// Configuration the texture was built from
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Page table quadtree
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// Tile atlas
    pub fn atlas(&self) -> &TiledTexture {
        &self.atlas
    }

    /// Atlas access for the uploader, e.g. to take dirty tiles
    pub fn atlas_mut(&mut self) -> &mut TiledTexture {
        &mut self.atlas
    }

    /// Page loader
    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    /// Outstanding feedback readbacks
    pub fn feedback_reader(&self) -> &FeedbackReader {
        &self.reader
    }

    /// Indirection buffer for upload
    pub fn indirection(&self) -> &IndirectionBuffer {
        &self.indirection
    }

    /// Feedback pass timing
    pub fn frame_stat(&self) -> &FrameStat {
        &self.frame_stat
    }

    /// `(table_size, 1 / table_size, max_mip_level, 0)`
    pub fn page_params(&self) -> Vec4 {
        self.page_table.shader_params()
    }

    /// `(padding / slot, tile / slot, 1 / columns, 1 / rows)`
    pub fn atlas_params(&self) -> Vec4 {
        self.atlas.atlas_params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{FrameClock, PageAddress};

    fn inline_texture(config: StreamingConfig) -> VirtualTexture {
        let source = Arc::new(ProceduralTileSource::new(&config));
        VirtualTexture::new(config, source, Box::new(InlineExecutor)).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = StreamingConfig::small();
        config.table_size = 6;
        let source = Arc::new(MemoryTileSource::new());

        assert!(matches!(
            VirtualTexture::new(config, source, Box::new(InlineExecutor)),
            Err(VtError::Config(CoreError::InvalidTableSize(6)))
        ));
    }

    #[test]
    fn test_streams_down_to_requested_mip() {
        let config = StreamingConfig::small();
        let mut texture = inline_texture(config);
        let mut clock = FrameClock::new();

        let mut reports = Vec::new();
        for _ in 0..12 {
            let frame = clock.advance();
            let image = FeedbackImage::filled(4, 4, [3, 3, 0, frame.stamp()]);
            assert!(texture.submit_feedback(Box::new(DelayedReadback::new(image, 0))));
            reports.push(texture.update(frame));
        }

        let entry = texture.indirection().texel(3, 3);
        assert_eq!(entry.mip, 0);
        assert_eq!(entry.stamp, clock.current().stamp());

        let finest = texture.page_table().get(3, 3, 0).unwrap();
        assert_eq!(texture.page_table().node(finest).payload.tile_index, Some(entry.tile()));

        let applied: usize = reports.iter().map(|r| r.completions_applied).sum();
        assert_eq!(applied, 4);
        assert!(reports.iter().all(|r| r.feedback_passes == 1));
        assert_eq!(texture.frame_stat().frames(), 12);
        assert_eq!(texture.atlas_mut().take_dirty_tiles().len(), 4);
        assert!(texture.is_settled());
    }

    #[test]
    fn test_readback_latency_delays_processing() {
        let mut texture = inline_texture(StreamingConfig::small());
        let image = FeedbackImage::filled(2, 2, [0, 0, 3, 0]);
        texture.submit_feedback(Box::new(DelayedReadback::new(image, 2)));

        assert_eq!(texture.update(FrameToken(1)).feedback_passes, 0);
        assert_eq!(texture.update(FrameToken(2)).feedback_passes, 0);
        assert_eq!(texture.update(FrameToken(3)).feedback_passes, 1);
        assert!(texture.loader().is_outstanding(PageAddress::new(0, 0, 3)));
    }

    #[test]
    fn test_readback_queue_is_bounded() {
        let mut texture = inline_texture(StreamingConfig::small());
        let image = FeedbackImage::filled(1, 1, [0, 0, 9, 0]);

        let accepted = (0..10)
            .filter(|_| texture.submit_feedback(Box::new(DelayedReadback::new(image.clone(), 100))))
            .count();
        assert_eq!(accepted, 8);
        assert_eq!(texture.feedback_reader().stats().dropped, 2);
    }

    #[test]
    fn test_unavailable_source_degrades_gracefully() {
        let config = StreamingConfig::small();
        let source = Arc::new(MemoryTileSource::new());
        source.set_offline(true);
        let mut texture = VirtualTexture::new(config, source, Box::new(InlineExecutor)).unwrap();

        let mut dropped = 0;
        for frame in 1..=6 {
            let image = FeedbackImage::filled(1, 1, [0, 0, 0, 0]);
            texture.submit_feedback(Box::new(DelayedReadback::new(image, 0)));
            dropped += texture.update(FrameToken(frame)).completions_dropped;
        }

        assert!(dropped >= 2);
        assert_eq!(texture.page_table().resident_count(), 0);
        assert!(texture.loader().stats().failed_requests >= 2);
        assert_eq!(texture.indirection().texel(0, 0).stamp, 0);
    }

    #[test]
    fn test_failed_readback_keeps_previous_frame() {
        let mut texture = inline_texture(StreamingConfig::small());
        let mut clock = FrameClock::new();
        for _ in 0..12 {
            let frame = clock.advance();
            let image = FeedbackImage::filled(4, 4, [3, 3, 0, frame.stamp()]);
            texture.submit_feedback(Box::new(DelayedReadback::new(image, 0)));
            texture.update(frame);
        }
        assert!(texture.is_settled());

        let indirection = texture.indirection().as_bytes().to_vec();
        let lru: Vec<u32> = texture.atlas().lru().iter_oldest_first().collect();
        let resident = texture.page_table().resident_count();

        texture.submit_feedback(Box::new(DelayedReadback::failing("device lost", 0)));
        let report = texture.update(clock.advance());

        assert_eq!(report.feedback_passes, 0);
        assert_eq!(report.activations, 0);
        assert!(!report.indirection_dirty);
        assert_eq!(texture.indirection().as_bytes(), indirection.as_slice());
        assert_eq!(texture.atlas().lru().iter_oldest_first().collect::<Vec<_>>(), lru);
        assert_eq!(texture.page_table().resident_count(), resident);
        assert_eq!(texture.feedback_reader().stats().failed, 1);
        assert!(texture.is_settled());
    }

    #[test]
    fn test_missing_pages_are_fetched_once() {
        let config = StreamingConfig::small();
        let slot = config.slot_size();
        let source = Arc::new(MemoryTileSource::new());
        for layer in 0..config.layer_count {
            let image = LayerImage::filled(slot, slot, config.bytes_per_texel, &[200]);
            source.insert(PageAddress::new(0, 0, 3), layer, image);
        }
        let mut texture = VirtualTexture::new(config, source.clone(), Box::new(InlineExecutor)).unwrap();

        let mut dropped = 0;
        for frame in 1..=40 {
            let image = FeedbackImage::filled(1, 1, [0, 0, 0, 0]);
            texture.submit_feedback(Box::new(DelayedReadback::new(image, 0)));
            dropped += texture.update(FrameToken(frame)).completions_dropped;
        }

        // One fetch per level from the root down to mip 0
        let stats = texture.loader().stats();
        assert_eq!(stats.requested, 4);
        assert_eq!(stats.failed_layers, 6);
        assert_eq!(source.fetch_count(), 8);
        assert_eq!(dropped, 0);

        assert_eq!(texture.indirection().texel(0, 0).mip, 0);
        assert_eq!(texture.page_table().resident_count(), 4);
        assert!(texture.is_settled());
    }

    #[test]
    fn test_thread_pool_texture() {
        let config = StreamingConfig::small();
        let source = Arc::new(ProceduralTileSource::new(&config));
        let mut texture = VirtualTexture::with_thread_pool(config, source).unwrap();

        let image = FeedbackImage::filled(1, 1, [5, 2, 3, 0]);
        texture.submit_feedback(Box::new(DelayedReadback::new(image, 0)));
        texture.update(FrameToken(1));

        let report = texture.update(FrameToken(2));
        assert_eq!(report.dispatched, 1);
        assert!(texture.wait_for_loads(Duration::from_secs(5)));
        assert_eq!(texture.update(FrameToken(3)).completions_applied, 1);
        assert!(texture.page_table().node(NodeId::ROOT).payload.is_ready());
    }

    #[test]
    fn test_shader_params() {
        let texture = inline_texture(StreamingConfig::small());
        assert_eq!(texture.page_params(), Vec4::new(8.0, 0.125, 3.0, 0.0));
        assert_eq!(texture.atlas_params().z, 0.5);
    }
}
