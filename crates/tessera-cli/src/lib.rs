//! # Tessera CLI
//!
//! Command-line interface for the Tessera virtual texture streamer.
//!
//! ## Commands
//! - `simulate` - Stream a synthetic zoom-in through a virtual texture
//! - `bake` - Write a procedural tile store to disk
//! - `config` - Print or write the default configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glam::UVec2;
use tessera_core::{FrameClock, FrameToken, PageAddress, StreamingConfig};
use tessera_vt::feedback::feedback_extent;
use tessera_vt::loader::LoaderStats;
use tessera_vt::{
    DelayedReadback, FeedbackImage, FileTileSource, InlineExecutor, ProceduralTileSource,
    TileSource, VirtualTexture,
};

/// Screen the synthetic feedback pass is scaled from
const SIMULATED_SCREEN: UVec2 = UVec2::new(320, 180);

/// Tessera virtual texture CLI
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a synthetic zoom-in through a virtual texture
    Simulate {
        /// Streaming configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of frames to run
        #[arg(short, long, default_value = "120")]
        frames: u32,

        /// Baked tile store to read instead of procedural tiles
        #[arg(short, long)]
        tiles: Option<PathBuf>,

        /// Fetch threads, overriding the configuration
        #[arg(long)]
        threads: Option<u32>,

        /// Frames before a feedback readback becomes available
        #[arg(short, long, default_value = "2")]
        latency: u32,

        /// Fetch on the update thread
        #[arg(long)]
        sync: bool,
    },

    /// Write a procedural tile store to disk
    Bake {
        /// Output directory
        #[arg(short, long)]
        out: PathBuf,

        /// Streaming configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Most detailed mip level to write
        #[arg(long, default_value = "0")]
        finest_mip: u32,
    },

    /// Print or write the default configuration
    Config {
        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Totals of a simulation run
#[derive(Debug, Clone)]
pub struct SimulationSummary {
    pub frames: u32,
    pub feedback_passes: usize,
    pub completions_applied: usize,
    pub resident_pages: usize,
    pub node_count: usize,
    pub loader: LoaderStats,
    pub average_feedback_millis: f64,
    pub average_fetch_millis: f64,
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cli.command {
        Commands::Simulate {
            config,
            frames,
            tiles,
            threads,
            latency,
            sync,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(threads) = threads {
                config.thread_limit = threads;
            }

            let source: Arc<dyn TileSource> = match &tiles {
                Some(dir) => {
                    log::info!("Streaming tiles from {}", dir.display());
                    Arc::new(FileTileSource::new(dir, &config))
                }
                None => Arc::new(ProceduralTileSource::new(&config)),
            };

            let summary = simulate(config, source, frames, latency, sync)?;
            log::info!("Simulation complete!");
            log::info!("  Frames: {}", summary.frames);
            log::info!("  Feedback passes: {}", summary.feedback_passes);
            log::info!(
                "  Resident pages: {} of {} nodes",
                summary.resident_pages,
                summary.node_count
            );
            log::info!(
                "  Loads: {} requested, {} completed, {} failed, {} duplicates",
                summary.loader.requested,
                summary.loader.completed,
                summary.loader.failed_requests,
                summary.loader.duplicates
            );
            log::info!("  Feedback pass: {:.3} ms average", summary.average_feedback_millis);
            log::info!("  Tile fetch: {:.3} ms average", summary.average_fetch_millis);
        }

        Commands::Bake {
            out,
            config,
            finest_mip,
        } => {
            let config = load_config(config.as_deref())?;
            log::info!("Baking tiles into {}...", out.display());
            let written = bake(&config, &out, finest_mip)?;
            log::info!("Bake complete! {} tile files written", written);
        }

        Commands::Config { output } => {
            let json = serde_json::to_string_pretty(&StreamingConfig::default())?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    log::info!("Wrote default configuration to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
    }

    Ok(())
}

/// Read a configuration file, or fall back to the defaults
pub fn load_config(path: Option<&Path>) -> Result<StreamingConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => StreamingConfig::default(),
    };

    config.validate()?;
    Ok(config)
}

/// Synthetic feedback for `frame` of a zoom towards the table centre
///
/// Detail rises with `progress` (0 to 1) and falls off towards the edges.
pub fn zoom_feedback(config: &StreamingConfig, progress: f32, frame: FrameToken) -> FeedbackImage {
    let extent = feedback_extent(SIMULATED_SCREEN, config.readback_scale);
    let max_mip = config.max_mip_level();
    let focus = max_mip - (progress.clamp(0.0, 1.0) * max_mip as f32).round() as u32;

    FeedbackImage::from_fn(extent.x, extent.y, |x, y| {
        let table_x = x * config.table_size / extent.x;
        let table_y = y * config.table_size / extent.y;

        let dx = (x as f32 + 0.5) / extent.x as f32 - 0.5;
        let dy = (y as f32 + 0.5) / extent.y as f32 - 0.5;
        let falloff = ((dx * dx + dy * dy).sqrt() * 4.0) as u32;
        let mip = (focus + falloff).min(max_mip);

        [table_x as u8, table_y as u8, mip as u8, frame.stamp()]
    })
}

/// Drive a virtual texture through `frames` frames of zoom feedback
pub fn simulate(
    config: StreamingConfig,
    source: Arc<dyn TileSource>,
    frames: u32,
    latency: u32,
    sync: bool,
) -> Result<SimulationSummary> {
    let feedback_config = config.clone();
    let mut texture = if sync {
        VirtualTexture::new(config, source, Box::new(InlineExecutor))?
    } else {
        VirtualTexture::with_thread_pool(config, source)?
    };

    let mut clock = FrameClock::new();
    let mut feedback_passes = 0;
    let mut completions_applied = 0;

    for index in 0..frames {
        let frame = clock.advance();
        let progress = index as f32 / frames.max(1) as f32;
        let image = zoom_feedback(&feedback_config, progress, frame);
        texture.submit_feedback(Box::new(DelayedReadback::new(image, latency)));

        let report = texture.update(frame);
        feedback_passes += report.feedback_passes;
        completions_applied += report.completions_applied;
        texture.atlas_mut().take_dirty_tiles();

        log::debug!(
            "Frame {}: {} loads applied, {} dispatched, {} cells written",
            frame,
            report.completions_applied,
            report.dispatched,
            report.cells_written
        );
        if index % 30 == 0 {
            log::info!(
                "Frame {}: {} resident pages, {} loads pending",
                frame,
                texture.page_table().resident_count(),
                texture.loader().pending_count() + texture.loader().in_flight_count()
            );
        }
    }

    // Let late fetches land before reporting
    while texture.wait_for_loads(Duration::from_millis(500)) {
        completions_applied += texture.update(clock.advance()).completions_applied;
    }

    Ok(SimulationSummary {
        frames,
        feedback_passes,
        completions_applied,
        resident_pages: texture.page_table().resident_count(),
        node_count: texture.page_table().node_count(),
        loader: texture.loader().stats(),
        average_feedback_millis: texture.frame_stat().average_millis(),
        average_fetch_millis: texture.loader().average_fetch_millis(),
    })
}

/// Write every page of mips `finest_mip..=max` for every layer
///
/// Returns the number of tile files written.
pub fn bake(config: &StreamingConfig, out: &Path, finest_mip: u32) -> Result<usize> {
    config.validate()?;
    let procedural = ProceduralTileSource::new(config);
    let files = FileTileSource::new(out, config);
    let max_mip = config.max_mip_level();
    let mut written = 0;

    for mip in finest_mip.min(max_mip)..=max_mip {
        let pages_per_side = 1u32 << (max_mip - mip);
        for layer in 0..config.layer_count {
            for y in 0..pages_per_side {
                for x in 0..pages_per_side {
                    let page = PageAddress::new(x, y, mip);
                    let image = procedural.fetch_layer(page, layer)?;
                    files.store().write_tile(page, layer, &image.texels)?;
                    written += 1;
                }
            }
        }
        let stored = files.store().count_tiles(0, mip)?;
        log::debug!(
            "Baked mip {} ({}x{} pages, {} files in layer 0)",
            mip,
            pages_per_side,
            pages_per_side,
            stored
        );
    }

    Ok(written)
}
