//! Page Table
//!
//! Quadtree over the virtual address space. The root covers the whole
//! table at the coarsest mip level and every child one quadrant of its
//! parent, one level finer. Nodes are created lazily the first time a
//! finer page under them is requested and are never destroyed.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. The table also
//! owns the reverse index from atlas slot to the node bound to it, which
//! is how a node learns that its slot was handed to another page.

use ahash::AHashMap;
use glam::Vec4;
use tessera_core::{FrameToken, PageAddress, StreamingConfig, TableRect, TileIndex};
use tessera_platform::ScopedTimer;

use crate::VtResult;
use crate::feedback::FeedbackImage;
use crate::indirection::IndirectionBuffer;
use crate::loader::{LoadCompletion, LoadRequest, LoadRequester};
use crate::tiled_texture::TiledTexture;

/// Index of a node in the page table arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// The root node, always present
    pub const ROOT: NodeId = NodeId(0);

    /// Arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Residency state of a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagePayload {
    /// Atlas slot holding this page, if resident
    pub tile_index: Option<TileIndex>,
    /// Last frame this page was selected for rendering
    pub active_frame: Option<FrameToken>,
    /// Fetch outstanding for this page
    pub pending_request: Option<LoadRequest>,
}

impl PagePayload {
    /// Whether the page has texels in the atlas
    pub fn is_ready(&self) -> bool {
        self.tile_index.is_some()
    }

    /// Whether a fetch is outstanding
    pub fn is_loading(&self) -> bool {
        self.pending_request.is_some()
    }

    /// Forget the atlas slot
    pub fn reset_tile_index(&mut self) {
        self.tile_index = None;
    }
}

/// One quadtree node
#[derive(Debug, Clone)]
pub struct TableNode {
    mip_level: u32,
    rect: TableRect,
    children: Option<[NodeId; 4]>,
    pub payload: PagePayload,
}

impl TableNode {
    fn new(mip_level: u32, rect: TableRect) -> Self {
        Self {
            mip_level,
            rect,
            children: None,
            payload: PagePayload::default(),
        }
    }

    /// Mip level, 0 being the most detailed
    pub fn mip_level(&self) -> u32 {
        self.mip_level
    }

    /// Covered cells
    pub fn rect(&self) -> TableRect {
        self.rect
    }

    /// Children in row-major quadrant order, once created
    pub fn children(&self) -> Option<[NodeId; 4]> {
        self.children
    }
}

/// What happened to a load completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Page bound to a slot
    Applied { node: NodeId, tile: TileIndex },
    /// No node was waiting for this exact request
    Stale,
    /// Fetch failed outright; page stays unloaded
    Failed { node: NodeId },
}

/// Result of one feedback pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackOutcome {
    pub pixels: usize,
    pub activations: usize,
    /// Activations that resolved to a resident page
    pub resolved: usize,
    pub cells_written: u32,
}

/// Page table counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageTableStats {
    pub activations: u64,
    pub rejected_activations: u64,
    pub unresolved_activations: u64,
    pub load_requests: u64,
    pub completions_applied: u64,
    pub stale_completions: u64,
    pub failed_completions: u64,
    pub invalidations: u64,
}

/// Quadtree page table
pub struct PageTable {
    table_size: u32,
    max_mip_level: u32,
    nodes: Vec<TableNode>,
    /// Atlas slot to the node bound to it
    active_tiles: AHashMap<TileIndex, NodeId>,
    stats: PageTableStats,
}

impl PageTable {
    /// Create a table holding only the root
    pub fn new(config: &StreamingConfig) -> VtResult<Self> {
        config.validate()?;

        let table_size = config.table_size;
        let max_mip_level = config.max_mip_level();
        let root = TableNode::new(max_mip_level, TableRect::new(0, 0, table_size, table_size));

        Ok(Self {
            table_size,
            max_mip_level,
            nodes: vec![root],
            active_tiles: AHashMap::new(),
            stats: PageTableStats::default(),
        })
    }

    /// Cells per side at mip 0
    pub fn table_size(&self) -> u32 {
        self.table_size
    }

    /// Mip level of the root
    pub fn max_mip_level(&self) -> u32 {
        self.max_mip_level
    }

    /// The root node
    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    /// Node by id
    pub fn node(&self, id: NodeId) -> &TableNode {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut TableNode {
        &mut self.nodes[id.index()]
    }

    /// Number of nodes created so far
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of pages bound to an atlas slot
    pub fn resident_count(&self) -> usize {
        self.active_tiles.len()
    }

    /// Node bound to an atlas slot
    pub fn tile_owner(&self, tile: TileIndex) -> Option<NodeId> {
        self.active_tiles.get(&tile).copied()
    }

    /// Every bound `(slot, node)` pair
    pub fn active_tiles(&self) -> impl Iterator<Item = (TileIndex, NodeId)> + '_ {
        self.active_tiles.iter().map(|(&tile, &node)| (tile, node))
    }

    /// Activation and completion counters
    pub fn stats(&self) -> &PageTableStats {
        &self.stats
    }

    /// Shader-side page table parameters
    ///
    /// `(table_size, 1 / table_size, max_mip_level, 0)`
    pub fn shader_params(&self) -> Vec4 {
        let size = self.table_size as f32;
        Vec4::new(size, 1.0 / size, self.max_mip_level as f32, 0.0)
    }

    /// Page address a node is fetched under
    ///
    /// Pages are counted in units of the node's own extent, so every cell
    /// inside the node maps to the same address.
    pub fn page_address(&self, id: NodeId) -> PageAddress {
        let node = self.node(id);
        let extent = node.rect.width.max(1);
        PageAddress::new(node.rect.x / extent, node.rect.y / extent, node.mip_level)
    }

    /// Existing node at `(x, y)` and `mip`, without creating any
    pub fn get(&self, x: u32, y: u32, mip: u32) -> Option<NodeId> {
        if mip > self.max_mip_level || x >= self.table_size || y >= self.table_size {
            return None;
        }

        let mut current = NodeId::ROOT;
        loop {
            let node = self.node(current);
            if node.mip_level == mip {
                return Some(current);
            }
            let children = node.children?;
            current = children[node.rect.quadrant(x, y)];
        }
    }

    /// Existing node for a page address
    pub fn get_page(&self, page: PageAddress) -> Option<NodeId> {
        if page.mip > self.max_mip_level {
            return None;
        }
        let extent = self.table_size >> (self.max_mip_level - page.mip);
        self.get(page.x * extent, page.y * extent, page.mip)
    }

    /// Deepest ready node on the path towards `(x, y)` at `mip`
    ///
    /// Descends only through existing children and never below `mip`.
    pub fn get_available(&self, x: u32, y: u32, mip: u32) -> Option<NodeId> {
        let mut current = NodeId::ROOT;
        let mut available = None;

        loop {
            let node = self.node(current);
            if node.payload.is_ready() {
                available = Some(current);
            }
            match node.children {
                Some(children) if node.mip_level > mip => {
                    current = children[node.rect.quadrant(x, y)];
                }
                _ => return available,
            }
        }
    }

    /// Child of `id` covering `(x, y)`, creating the four children on first use
    ///
    /// Returns `None` for a node at mip 0.
    pub fn get_child(&mut self, id: NodeId, x: u32, y: u32) -> Option<NodeId> {
        let (mip_level, rect, existing) = {
            let node = self.node(id);
            (node.mip_level, node.rect, node.children)
        };
        if mip_level == 0 {
            return None;
        }

        let children = match existing {
            Some(children) => children,
            None => {
                let first = self.nodes.len() as u32;
                self.nodes.extend(
                    rect.split()
                        .into_iter()
                        .map(|quadrant| TableNode::new(mip_level - 1, quadrant)),
                );

                let children = [NodeId(first), NodeId(first + 1), NodeId(first + 2), NodeId(first + 3)];
                self.node_mut(id).children = Some(children);
                children
            }
        };

        Some(children[rect.quadrant(x, y)])
    }

    /// Request a fetch of a node unless one is already outstanding
    pub fn load_page(&mut self, id: NodeId, loader: &mut dyn LoadRequester) {
        if self.node(id).payload.is_loading() {
            return;
        }

        let page = self.page_address(id);
        let request = loader.request(page.x, page.y, page.mip);
        if request.is_some() {
            self.stats.load_requests += 1;
        }
        self.node_mut(id).payload.pending_request = request;
    }

    /// Select the page that will render `(x, y)` wanting `mip`
    ///
    /// Returns the deepest resident page on the way, requesting the next
    /// finer level under it. With nothing resident the root is requested
    /// and `None` returned. Mips beyond the table depth and cells outside
    /// the table mean "nothing needed".
    pub fn activate_page(
        &mut self,
        x: u32,
        y: u32,
        mip: u32,
        frame: FrameToken,
        loader: &mut dyn LoadRequester,
        atlas: &mut TiledTexture,
    ) -> Option<NodeId> {
        if mip > self.max_mip_level || x >= self.table_size || y >= self.table_size {
            self.stats.rejected_activations += 1;
            return None;
        }
        self.stats.activations += 1;

        let Some(id) = self.get_available(x, y, mip) else {
            self.stats.unresolved_activations += 1;
            self.load_page(NodeId::ROOT, loader);
            return None;
        };

        if self.node(id).mip_level > mip {
            if let Some(child) = self.get_child(id, x, y) {
                self.load_page(child, loader);
            }
        }

        let node = self.node_mut(id);
        node.payload.active_frame = Some(frame);
        if let Some(tile) = node.payload.tile_index {
            atlas.set_active(tile, frame);
        }

        log::trace!("Activated ({}, {}) @ mip {} -> {:?}", x, y, mip, id);
        Some(id)
    }

    /// Activate every feedback pixel, then rewrite the indirection cells of
    /// every page used this frame
    pub fn process_feedback(
        &mut self,
        feedback: &FeedbackImage,
        frame: FrameToken,
        loader: &mut dyn LoadRequester,
        atlas: &mut TiledTexture,
        indirection: &mut IndirectionBuffer,
    ) -> FeedbackOutcome {
        let _timer = ScopedTimer::traced("process_feedback");
        let mut outcome = FeedbackOutcome::default();
        let mut previous: Option<[u8; 3]> = None;

        for pixel in feedback.pixels() {
            outcome.pixels += 1;
            let request = [pixel[0], pixel[1], pixel[2]];
            if previous == Some(request) {
                continue;
            }
            previous = Some(request);

            outcome.activations += 1;
            let resolved = self.activate_page(
                u32::from(request[0]),
                u32::from(request[1]),
                u32::from(request[2]),
                frame,
                loader,
                atlas,
            );
            if resolved.is_some() {
                outcome.resolved += 1;
            }
        }

        for (&tile, &id) in &self.active_tiles {
            let node = &self.nodes[id.index()];
            if node.payload.active_frame != Some(frame) {
                continue;
            }
            outcome.cells_written += indirection.write_node(node.rect, tile, node.mip_level, frame);
        }

        log::debug!(
            "Feedback {}: {} pixels, {} activations, {} cells written",
            frame,
            outcome.pixels,
            outcome.activations,
            outcome.cells_written
        );
        outcome
    }

    /// Install a finished fetch
    ///
    /// Only a node still waiting for exactly this request accepts it. The
    /// page is bound to the least recently used slot, whose previous owner
    /// is invalidated. Layers that did not arrive keep whatever texels the
    /// slot already held, even when no layer arrived at all.
    pub fn on_load_complete(&mut self, completion: LoadCompletion, atlas: &mut TiledTexture) -> CompletionOutcome {
        let request = completion.request;
        let node_id = self
            .get_page(request.page())
            .filter(|&id| self.node(id).payload.pending_request == Some(request));

        let Some(id) = node_id else {
            self.stats.stale_completions += 1;
            log::debug!(
                "Dropping stale completion for {} (serial {})",
                request.page(),
                request.serial()
            );
            return CompletionOutcome::Stale;
        };

        self.node_mut(id).payload.pending_request = None;

        let layers = match completion.result {
            Ok(layers) => layers,
            Err(e) => {
                self.stats.failed_completions += 1;
                log::debug!("Load of {} failed: {}", request.page(), e);
                return CompletionOutcome::Failed { node: id };
            }
        };

        if let Some(previous) = self.node(id).payload.tile_index {
            self.active_tiles.remove(&previous);
        }

        let tile = atlas.request_tile();
        let updated = atlas.update_tile(tile, &layers);
        self.invalidate_page(updated.tile);
        if updated.layers_written == 0 {
            log::debug!("No layers arrived for {}, binding stale texels", request.page());
        }

        self.node_mut(id).payload.tile_index = Some(tile);
        self.active_tiles.insert(tile, id);
        self.stats.completions_applied += 1;

        log::debug!("Bound {} to tile ({}, {})", request.page(), tile.x, tile.y);
        CompletionOutcome::Applied { node: id, tile }
    }

    /// Unbind whatever node holds `tile`
    pub fn invalidate_page(&mut self, tile: TileIndex) -> Option<NodeId> {
        let id = self.active_tiles.remove(&tile)?;
        self.node_mut(id).payload.reset_tile_index();
        self.stats.invalidations += 1;
        Some(id)
    }
}
