//! Page Loader
//!
//! Accepts load requests, de-duplicates them by page address, caps the
//! number of fetches in flight and hands results back to the update thread.
//!
//! Fetches run on a [`FetchExecutor`]. Every fetch reports through a
//! crossbeam channel, and [`Loader::poll`] drains that channel, so page
//! table state is only ever mutated by the thread that owns the loader.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashSet;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use smallvec::SmallVec;
use tessera_core::{DispatchOrder, PageAddress, StreamingConfig};
use tessera_platform::{PerfCounter, ThreadPool};

use crate::VtResult;
use crate::source::{LayerImage, SourceError, TileSource};

/// One fetch, identified by page address and a unique serial
///
/// Two requests for the same page are the same identity; they are exactly
/// equal only when the serial matches too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadRequest {
    page: PageAddress,
    serial: u64,
}

impl LoadRequest {
    /// Create a request handle
    pub fn new(page: PageAddress, serial: u64) -> Self {
        Self { page, serial }
    }

    /// Page x coordinate at the request's mip level
    pub fn page_x(&self) -> u32 {
        self.page.x
    }

    /// Page y coordinate at the request's mip level
    pub fn page_y(&self) -> u32 {
        self.page.y
    }

    /// Requested mip level
    pub fn mip_level(&self) -> u32 {
        self.page.mip
    }

    /// Requested page
    pub fn page(&self) -> PageAddress {
        self.page
    }

    /// Serial number, unique per loader
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

/// Per-layer fetch results; `None` marks a layer that failed
pub type LayerSet = SmallVec<[Option<LayerImage>; 4]>;

/// Result of one load request, delivered exactly once
#[derive(Debug)]
pub struct LoadCompletion {
    pub request: LoadRequest,
    pub result: Result<LayerSet, SourceError>,
}

impl LoadCompletion {
    /// Whether at least one layer arrived
    pub fn has_layers(&self) -> bool {
        self.result
            .as_ref()
            .is_ok_and(|layers| layers.iter().any(Option::is_some))
    }
}

/// Issues load requests on behalf of the page table
pub trait LoadRequester {
    /// Request `(x, y)` at `mip`, or `None` if that page is already outstanding
    fn request(&mut self, x: u32, y: u32, mip: u32) -> Option<LoadRequest>;
}

/// Unit of fetch work
pub type FetchTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs fetch tasks somewhere
pub trait FetchExecutor: Send + Sync {
    /// Run or schedule a task; `false` if it was dropped
    fn execute(&self, task: FetchTask) -> bool;
}

impl FetchExecutor for ThreadPool {
    fn execute(&self, task: FetchTask) -> bool {
        self.submit(task)
    }
}

/// Runs every task immediately on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl FetchExecutor for InlineExecutor {
    fn execute(&self, task: FetchTask) -> bool {
        task();
        true
    }
}

/// Loader counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub requested: u64,
    pub duplicates: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed_requests: u64,
    pub failed_layers: u64,
    pub peak_pending: usize,
}

/// Demand loader with bounded concurrency
pub struct Loader {
    source: Arc<dyn TileSource>,
    executor: Box<dyn FetchExecutor>,
    layer_count: u32,
    thread_limit: usize,
    order: DispatchOrder,
    /// Requests waiting for a fetch slot
    pending: Vec<LoadRequest>,
    /// Every page that is pending or in flight
    outstanding: AHashSet<PageAddress>,
    in_flight: usize,
    sender: Sender<LoadCompletion>,
    receiver: Receiver<LoadCompletion>,
    /// Completions received by `wait_for_completion` but not yet polled
    ready: Vec<LoadCompletion>,
    next_serial: u64,
    failed_layers: Arc<AtomicU64>,
    fetch_timer: Arc<PerfCounter>,
    stats: LoaderStats,
}

impl Loader {
    /// Create a loader fetching from `source` on `executor`
    pub fn new(
        config: &StreamingConfig,
        source: Arc<dyn TileSource>,
        executor: Box<dyn FetchExecutor>,
    ) -> VtResult<Self> {
        config.validate()?;
        let (sender, receiver) = unbounded();

        Ok(Self {
            source,
            executor,
            layer_count: config.layer_count,
            thread_limit: config.thread_limit as usize,
            order: config.dispatch_order,
            pending: Vec::new(),
            outstanding: AHashSet::new(),
            in_flight: 0,
            sender,
            receiver,
            ready: Vec::new(),
            next_serial: 0,
            failed_layers: Arc::new(AtomicU64::new(0)),
            fetch_timer: Arc::new(PerfCounter::new("tile_fetch")),
            stats: LoaderStats::default(),
        })
    }

    /// Queue a fetch for `(x, y)` at `mip`
    ///
    /// Returns `None` without queueing anything if the same page is already
    /// pending or in flight.
    pub fn request(&mut self, x: u32, y: u32, mip: u32) -> Option<LoadRequest> {
        let page = PageAddress::new(x, y, mip);
        if !self.outstanding.insert(page) {
            self.stats.duplicates += 1;
            return None;
        }

        let request = LoadRequest::new(page, self.next_serial);
        self.next_serial += 1;
        self.pending.push(request);

        self.stats.requested += 1;
        self.stats.peak_pending = self.stats.peak_pending.max(self.pending.len());
        log::trace!("Queued load {} (serial {})", page, request.serial);
        Some(request)
    }

    /// Start fetches until the in-flight window is full
    ///
    /// Returns the number of fetches started.
    pub fn dispatch(&mut self) -> usize {
        let mut started = 0;

        while self.in_flight < self.thread_limit && !self.pending.is_empty() {
            self.pending.sort_by_key(LoadRequest::mip_level);
            let request = match self.order {
                DispatchOrder::CoarsestFirst => self.pending.pop(),
                DispatchOrder::FinestFirst => Some(self.pending.remove(0)),
            };
            let Some(request) = request else {
                break;
            };

            self.start_fetch(request);
            started += 1;
        }

        started
    }

    fn start_fetch(&mut self, request: LoadRequest) {
        let source = self.source.clone();
        let sender = self.sender.clone();
        let failed_layers = self.failed_layers.clone();
        let fetch_timer = self.fetch_timer.clone();
        let layer_count = self.layer_count;

        self.in_flight += 1;
        self.stats.dispatched += 1;
        log::debug!("Fetching {} from {}", request.page, source.name());

        let task: FetchTask = Box::new(move || {
            let result = fetch_timer
                .time(|| fetch_layers(source.as_ref(), request.page, layer_count, &failed_layers));
            let _ = sender.send(LoadCompletion { request, result });
        });

        if !self.executor.execute(task) {
            log::warn!("Fetch executor rejected {}", request.page);
            let _ = self.sender.send(LoadCompletion {
                request,
                result: Err(SourceError::Unavailable("fetch executor rejected the task".into())),
            });
        }
    }

    /// Collect every completion that has arrived
    ///
    /// Each request is delivered exactly once. Its page may be requested
    /// again as soon as it has been returned here.
    pub fn poll(&mut self) -> Vec<LoadCompletion> {
        let mut completions = std::mem::take(&mut self.ready);
        completions.extend(self.receiver.try_iter());

        for completion in &completions {
            self.retire(completion);
        }
        completions
    }

    /// Block until a completion is available or `timeout` passes
    ///
    /// The completion is kept for the next [`Loader::poll`]. Returns
    /// `false` on timeout or if nothing is in flight.
    pub fn wait_for_completion(&mut self, timeout: Duration) -> bool {
        if !self.ready.is_empty() {
            return true;
        }
        if self.in_flight == 0 {
            return false;
        }

        match self.receiver.recv_timeout(timeout) {
            Ok(completion) => {
                self.ready.push(completion);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn retire(&mut self, completion: &LoadCompletion) {
        self.outstanding.remove(&completion.request.page);
        self.in_flight = self.in_flight.saturating_sub(1);

        match &completion.result {
            Ok(_) => self.stats.completed += 1,
            Err(e) => {
                self.stats.failed_requests += 1;
                log::warn!("Load {} failed: {}", completion.request.page, e);
            }
        }
    }

    /// Check whether a page is pending or in flight
    pub fn is_outstanding(&self, page: PageAddress) -> bool {
        self.outstanding.contains(&page)
    }

    /// Requests waiting for a fetch slot
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fetches started but not yet polled
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
    }

    /// Nothing pending and nothing in flight
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight == 0
    }

    /// Mean fetch time in milliseconds
    pub fn average_fetch_millis(&self) -> f64 {
        self.fetch_timer.average_millis()
    }

    /// Snapshot of the loader counters
    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            failed_layers: self.failed_layers.load(Ordering::Relaxed),
            ..self.stats.clone()
        }
    }
}

impl LoadRequester for Loader {
    fn request(&mut self, x: u32, y: u32, mip: u32) -> Option<LoadRequest> {
        Loader::request(self, x, y, mip)
    }
}

/// Fetch every layer of a page
///
/// A fatal source error fails the request. Any other error costs only that
/// layer.
fn fetch_layers(
    source: &dyn TileSource,
    page: PageAddress,
    layer_count: u32,
    failed_layers: &AtomicU64,
) -> Result<LayerSet, SourceError> {
    let mut layers = LayerSet::with_capacity(layer_count as usize);

    for layer in 0..layer_count {
        match source.fetch_layer(page, layer) {
            Ok(image) => layers.push(Some(image)),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log::debug!("Layer {} of {} failed: {}", layer, page, e);
                failed_layers.fetch_add(1, Ordering::Relaxed);
                layers.push(None);
            }
        }
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemoryTileSource, ProceduralTileSource};

    fn inline_loader(config: &StreamingConfig, source: Arc<dyn TileSource>) -> Loader {
        Loader::new(config, source, Box::new(InlineExecutor)).unwrap()
    }

    fn procedural(config: &StreamingConfig) -> Arc<dyn TileSource> {
        Arc::new(ProceduralTileSource::new(config))
    }

    #[test]
    fn test_duplicate_request_is_noop() {
        let config = StreamingConfig::small();
        let mut loader = inline_loader(&config, procedural(&config));

        let first = loader.request(0, 0, 3);
        assert!(first.is_some());
        assert!(loader.request(0, 0, 3).is_none());
        assert_eq!(loader.pending_count(), 1);

        loader.dispatch();
        assert!(loader.request(0, 0, 3).is_none());

        let completions = loader.poll();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].request, first.unwrap());
        assert!(loader.poll().is_empty());

        let stats = loader.stats();
        assert_eq!(stats.requested, 1);
        assert_eq!(stats.duplicates, 2);
        assert_eq!(stats.completed, 1);

        // Retired pages may be requested again, with a fresh serial
        let again = loader.request(0, 0, 3).unwrap();
        assert_ne!(again, first.unwrap());
        assert_eq!(again.page(), first.unwrap().page());
    }

    #[test]
    fn test_at_most_one_outstanding_per_page() {
        let config = StreamingConfig::small();
        let mut loader = inline_loader(&config, procedural(&config));

        let mut issued = 0;
        for round in 0..3 {
            for mip in 0..=3 {
                if loader.request(round % 2, 0, mip).is_some() {
                    issued += 1;
                }
            }
        }

        // Two distinct x values times four mips
        assert_eq!(issued, 8);
        assert_eq!(loader.pending_count(), 8);
    }

    #[test]
    fn test_coarsest_first_dispatch() {
        let mut config = StreamingConfig::small();
        config.thread_limit = 1;
        let mut loader = inline_loader(&config, procedural(&config));

        loader.request(0, 0, 0);
        loader.request(0, 0, 2);
        loader.request(0, 0, 1);

        let mut order = Vec::new();
        while !loader.is_idle() {
            loader.dispatch();
            order.extend(loader.poll().into_iter().map(|c| c.request.mip_level()));
        }

        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn test_finest_first_dispatch() {
        let mut config = StreamingConfig::small();
        config.thread_limit = 1;
        config.dispatch_order = DispatchOrder::FinestFirst;
        let mut loader = inline_loader(&config, procedural(&config));

        loader.request(0, 0, 2);
        loader.request(0, 0, 0);
        loader.request(0, 0, 1);

        let mut order = Vec::new();
        while !loader.is_idle() {
            loader.dispatch();
            order.extend(loader.poll().into_iter().map(|c| c.request.mip_level()));
        }

        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_thread_limit_caps_in_flight() {
        let config = StreamingConfig::small();
        let mut loader = inline_loader(&config, procedural(&config));

        for x in 0..5 {
            loader.request(x, 0, 0);
        }

        assert_eq!(loader.dispatch(), 2);
        assert_eq!(loader.in_flight_count(), 2);
        assert_eq!(loader.pending_count(), 3);
        assert_eq!(loader.dispatch(), 0);

        assert_eq!(loader.poll().len(), 2);
        assert_eq!(loader.in_flight_count(), 0);
        assert_eq!(loader.dispatch(), 2);
        assert_eq!(loader.stats().peak_pending, 5);
    }

    #[test]
    fn test_partial_layer_failure_still_completes() {
        let config = StreamingConfig::small();
        let source = Arc::new(MemoryTileSource::new());
        let page = PageAddress::new(0, 0, 3);
        source.insert(page, 1, LayerImage::filled(6, 6, 4, &[7]));

        let mut loader = inline_loader(&config, source);
        loader.request(0, 0, 3);
        loader.dispatch();

        let completions = loader.poll();
        assert_eq!(completions.len(), 1);
        let layers = completions[0].result.as_ref().unwrap();
        assert_eq!(layers.len(), 2);
        assert!(layers[0].is_none());
        assert!(layers[1].is_some());
        assert!(completions[0].has_layers());

        let stats = loader.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed_layers, 1);
        assert_eq!(stats.failed_requests, 0);
    }

    #[test]
    fn test_fatal_error_fails_request() {
        let config = StreamingConfig::small();
        let source = Arc::new(MemoryTileSource::new());
        source.set_offline(true);

        let mut loader = inline_loader(&config, source.clone());
        loader.request(1, 1, 0);
        loader.dispatch();

        let completions = loader.poll();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].result.is_err());
        assert!(!completions[0].has_layers());
        assert_eq!(loader.stats().failed_requests, 1);
        // The first fatal layer stops the fetch
        assert_eq!(source.fetch_count(), 1);
        assert!(!loader.is_outstanding(PageAddress::new(1, 1, 0)));
    }

    #[test]
    fn test_thread_pool_loader() {
        let config = StreamingConfig::small();
        let pool = ThreadPool::new("loader-test", 2).unwrap();
        let mut loader = Loader::new(&config, procedural(&config), Box::new(pool)).unwrap();

        for x in 0..4 {
            loader.request(x, 0, 0);
        }

        let mut completed = 0;
        while completed < 4 {
            loader.dispatch();
            assert!(loader.wait_for_completion(Duration::from_secs(5)));
            completed += loader.poll().len();
        }

        assert!(loader.is_idle());
        assert!(!loader.wait_for_completion(Duration::from_millis(1)));
        assert_eq!(loader.stats().completed, 4);
    }
}
