//! Two-tier tile cache with a background production worker.
//!
//! Lookups never block on the producer: a full miss enqueues the coordinate
//! and returns immediately so the viewport can redraw, and the worker thread
//! produces the tile in the background. Memory entries age out on a fixed
//! clock; the disk tier is an opportunistic accelerator that survives
//! restarts, not a database.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chartpad_core::{TileCoords, TileImage, TileSource, TileSourceError};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::stats::CacheStats;

/// Default age in seconds past which memory entries are swept.
pub const CACHE_SECONDS: u64 = 30;

/// Errors surfaced by [`TileCache::get_tile`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The source rejected the coordinates as unrepresentable.
    #[error("invalid tile coordinates {0}")]
    InvalidCoordinates(TileCoords),

    /// A previous production of this tile failed. Cleared by
    /// [`TileCache::cancel_pending_requests`] or [`TileCache::purge`].
    #[error("tile {0} failed to load previously")]
    CorruptTile(TileCoords),
}

struct MemEntry {
    image: Arc<TileImage>,
    last_access: Instant,
}

struct CacheState {
    /// Artifact path → pixels + last access. Written only under the lock,
    /// by the worker after production or by a lookup promoting a disk hit.
    memory: HashMap<String, MemEntry>,
    /// Coordinates awaiting background production. Set semantics make
    /// re-requests of a pending tile free.
    load_set: BTreeSet<TileCoords>,
    /// Coordinates whose production failed; lookups fail fast until cleared.
    error_set: BTreeSet<TileCoords>,
    cache_dir: Option<PathBuf>,
    keep_alive: bool,
    stats: CacheStats,
}

impl CacheState {
    fn has_work(&self) -> bool {
        !self.keep_alive || !self.load_set.is_empty()
    }

    fn hit_memory(&mut self, path: &str) -> Option<Arc<TileImage>> {
        let entry = self.memory.get_mut(path)?;
        entry.last_access = Instant::now();
        self.stats.hits += 1;
        Some(Arc::clone(&entry.image))
    }

    fn insert_memory(&mut self, path: String, image: Arc<TileImage>) {
        self.memory.insert(
            path,
            MemEntry {
                image,
                last_access: Instant::now(),
            },
        );
        self.stats.tile_count = self.memory.len();
    }
}

struct Shared {
    source: Arc<dyn TileSource>,
    state: Mutex<CacheState>,
    work_ready: Condvar,
    cache_seconds: u64,
    worker_tick: Duration,
}

/// Two-level tile cache over a [`TileSource`].
///
/// Lookup order is error memo → memory → disk → background queue. The cache
/// owns one loader thread which it joins on drop; any number of caller
/// threads may look up, purge, or cancel concurrently.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use chartpad_cache::TileCache;
/// # fn open_source() -> Arc<dyn chartpad_core::TileSource> { unimplemented!() }
///
/// let cache = TileCache::new(open_source());
/// cache.set_cache_directory("/tmp/chartpad-tiles");
///
/// // Miss: the viewport draws a blank tile and polls again next frame.
/// if let Ok(Some(tile)) = cache.get_tile(4, 2, 3) {
///     println!("tile is {}x{}", tile.width(), tile.height());
/// }
/// ```
pub struct TileCache {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl TileCache {
    /// Create a cache over `source` with default configuration and spawn
    /// its loader thread.
    pub fn new(source: Arc<dyn TileSource>) -> Self {
        Self::with_config(source, CacheConfig::default())
    }

    /// Create a cache with an explicit [`CacheConfig`].
    pub fn with_config(source: Arc<dyn TileSource>, config: CacheConfig) -> Self {
        let shared = Arc::new(Shared {
            source,
            state: Mutex::new(CacheState {
                memory: HashMap::new(),
                load_set: BTreeSet::new(),
                error_set: BTreeSet::new(),
                cache_dir: None,
                keep_alive: true,
                stats: CacheStats::default(),
            }),
            work_ready: Condvar::new(),
            cache_seconds: config.cache_seconds,
            worker_tick: config.worker_tick,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("chartpad-tile-loader".to_string())
            .spawn(move || worker_shared.load_loop())
            .expect("failed to spawn tile loader thread");

        let cache = Self {
            shared,
            worker: Some(worker),
        };
        if let Some(dir) = config.cache_dir {
            cache.set_cache_directory(dir);
        }
        cache
    }

    /// Point the disk tier at `path`, creating the directory if missing.
    ///
    /// Directory creation failure is logged and tolerated; the disk tier
    /// then simply never hits.
    pub fn set_cache_directory<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            if let Err(err) = fs::create_dir_all(&path) {
                warn!("cannot create cache directory {}: {err}", path.display());
            }
        }
        self.shared.state.lock().unwrap().cache_dir = Some(path);
    }

    /// Look up a tile without blocking on production.
    ///
    /// Returns `Ok(Some(image))` on a memory or disk hit, `Ok(None)` on a
    /// miss (the tile is now queued; poll again on a later frame), or an
    /// error when the coordinates are unrepresentable or the tile is
    /// memoized as failed.
    pub fn get_tile(&self, x: i32, y: i32, zoom: i32) -> Result<Option<Arc<TileImage>>, CacheError> {
        let raw = TileCoords::new(x, y, zoom);
        let coords = self
            .shared
            .source
            .normalize(raw)
            .ok_or(CacheError::InvalidCoordinates(raw))?;

        let mut state = self.shared.state.lock().unwrap();

        if state.error_set.contains(&coords) {
            return Err(CacheError::CorruptTile(coords));
        }

        let path = self.shared.source.tile_path(coords);

        if let Some(image) = state.hit_memory(&path) {
            return Ok(Some(image));
        }

        // Disk read happens under the lock: artifact decode is cheap next
        // to a frame budget, and it keeps the memory promotion atomic.
        if let Some(image) = Shared::read_disk(&mut state, &path) {
            return Ok(Some(image));
        }

        state.stats.misses += 1;
        state.load_set.insert(coords);
        self.shared.work_ready.notify_one();
        Ok(None)
    }

    /// Cancel all pending producer work and clear the load and error sets.
    ///
    /// Already-cached tiles stay in memory; use [`TileCache::purge`] to
    /// drop those as well.
    pub fn cancel_pending_requests(&self) {
        let mut state = self.shared.state.lock().unwrap();
        self.shared.source.cancel_pending_loads();
        state.error_set.clear();
        state.load_set.clear();
    }

    /// Discard all in-flight work and the whole memory tier.
    ///
    /// Used when the viewport jumps to a radically new region. The disk
    /// tier is untouched.
    pub fn purge(&self) {
        self.cancel_pending_requests();
        let mut state = self.shared.state.lock().unwrap();
        state.memory.clear();
        state.stats.tile_count = 0;
    }

    /// Current usage counters.
    pub fn stats(&self) -> CacheStats {
        self.shared.state.lock().unwrap().stats
    }

    /// Number of tiles currently held in memory.
    pub fn tile_count(&self) -> usize {
        self.shared.state.lock().unwrap().memory.len()
    }

    /// Number of coordinates queued for background production.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().unwrap().load_set.len()
    }

    /// Whether an artifact path is currently in the memory tier.
    pub fn contains_path(&self, path: &str) -> bool {
        self.shared.state.lock().unwrap().memory.contains_key(path)
    }
}

impl Drop for TileCache {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.keep_alive = false;
            self.shared.source.cancel_pending_loads();
            self.shared.work_ready.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            worker.join().expect("tile loader thread panicked");
        }
    }
}

impl Shared {
    /// Worker loop: wait for queued coordinates (waking at least once per
    /// tick so the age sweep runs even when idle), produce one tile, sweep.
    fn load_loop(&self) {
        loop {
            let mut next = None;
            {
                let state = self.state.lock().unwrap();
                let (mut state, _timeout) = self
                    .work_ready
                    .wait_timeout_while(state, self.worker_tick, |s| !s.has_work())
                    .unwrap();

                if !state.keep_alive {
                    break;
                }

                if let Some(coords) = state.load_set.pop_first() {
                    // Clear any latched cancellation before this load runs.
                    self.source.resume_loading();
                    next = Some(coords);
                }
            }

            if let Some(coords) = next {
                let path = self.source.tile_path(coords);
                // Another coordinate mapping onto the same artifact may have
                // filled it while this one sat in the queue.
                if !self.touch_memory(&path) {
                    self.load_and_cache(coords, &path);
                }
            }

            self.flush_cache();
        }
    }

    fn touch_memory(&self, path: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.memory.get_mut(path) {
            Some(entry) => {
                entry.last_access = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Produce one tile, persist it, and publish it to the memory tier.
    /// Runs unlocked except for the final insert.
    fn load_and_cache(&self, coords: TileCoords, path: &str) {
        let mut image = match self.source.load_tile(coords) {
            Ok(image) => image,
            Err(TileSourceError::Cancelled) => return,
            Err(err) => {
                debug!("marking tile {coords} as error: {err}");
                let mut state = self.state.lock().unwrap();
                state.error_set.insert(coords);
                state.stats.errors += 1;
                return;
            }
        };

        let target = {
            let state = self.state.lock().unwrap();
            state.cache_dir.as_ref().map(|dir| dir.join(path))
        };
        if let Some(target) = target {
            if let Err(err) = image.store_and_clear_encoded_data(&target) {
                warn!("cannot persist tile {coords} to {}: {err}", target.display());
            }
        }

        let mut state = self.state.lock().unwrap();
        state.insert_memory(path.to_string(), Arc::new(image));
    }

    /// Disk tier lookup. Called with the state lock held; promotes a hit
    /// into the memory tier. A file that exists but fails to decode is
    /// deleted so the ordinary miss path re-produces it.
    fn read_disk(state: &mut CacheState, path: &str) -> Option<Arc<TileImage>> {
        let file = state.cache_dir.as_ref()?.join(path);
        if !file.exists() {
            return None;
        }

        match TileImage::load_image_file(&file) {
            Ok(image) => {
                let image = Arc::new(image);
                state.insert_memory(path.to_string(), Arc::clone(&image));
                state.stats.hits += 1;
                Some(image)
            }
            Err(err) => {
                warn!("discarding unreadable cache file {}: {err}", file.display());
                let _ = fs::remove_file(&file);
                None
            }
        }
    }

    /// Evict memory entries whose age reached the configured threshold.
    fn flush_cache(&self) {
        let mut state = self.state.lock().unwrap();
        let max_age = Duration::from_secs(self.cache_seconds);
        let now = Instant::now();
        let before = state.memory.len();
        state
            .memory
            .retain(|_, entry| now.duration_since(entry.last_access) < max_age);
        state.stats.evictions += (before - state.memory.len()) as u64;
        state.stats.tile_count = state.memory.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartpad_core::CancelFlag;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Producer test double with a configurable delay and failure set.
    struct MockSource {
        cancel: CancelFlag,
        delay: Duration,
        fail: BTreeSet<TileCoords>,
        calls: AtomicU64,
        completed: AtomicU64,
    }

    impl MockSource {
        fn new(delay: Duration) -> Self {
            Self {
                cancel: CancelFlag::new(),
                delay,
                fail: BTreeSet::new(),
                calls: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            }
        }

        fn failing_on(delay: Duration, coords: TileCoords) -> Self {
            let mut source = Self::new(delay);
            source.fail.insert(coords);
            source
        }
    }

    impl TileSource for MockSource {
        fn normalize(&self, coords: TileCoords) -> Option<TileCoords> {
            if coords.x < 0 || coords.y < 0 || coords.zoom < 0 {
                None
            } else {
                Some(coords)
            }
        }

        fn tile_path(&self, coords: TileCoords) -> String {
            format!("{}/{}/{}.png", coords.zoom, coords.x, coords.y)
        }

        fn load_tile(&self, coords: TileCoords) -> Result<TileImage, TileSourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.cancel.is_cancelled() {
                return Err(TileSourceError::Cancelled);
            }
            thread::sleep(self.delay);
            if self.cancel.is_cancelled() {
                return Err(TileSourceError::Cancelled);
            }
            if self.fail.contains(&coords) {
                return Err(TileSourceError::Fault("synthetic failure".to_string()));
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(TileImage::new(4, 4, [0, 64, 128, 255]))
        }

        fn cancel_pending_loads(&self) {
            self.cancel.cancel();
        }

        fn resume_loading(&self) {
            self.cancel.reset();
        }
    }

    fn fast_config() -> CacheConfig {
        CacheConfig::default().with_worker_tick(Duration::from_millis(20))
    }

    fn poll_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_cold_miss_then_warm_hit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = Arc::new(MockSource::new(Duration::from_millis(10)));
        let cache = TileCache::with_config(source.clone(), fast_config());
        cache.set_cache_directory(dir.path());

        assert!(cache.get_tile(0, 0, 0).expect("lookup").is_none());
        assert_eq!(cache.pending_count(), 1);

        let warm = poll_until(Duration::from_secs(5), || {
            matches!(cache.get_tile(0, 0, 0), Ok(Some(_)))
        });
        assert!(warm, "tile never became available");

        let artifact = dir.path().join(source.tile_path(TileCoords::new(0, 0, 0)));
        assert!(poll_until(Duration::from_secs(5), || artifact.exists()));
    }

    #[test]
    fn test_disk_warmed_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = Arc::new(MockSource::new(Duration::from_millis(10)));

        let path = dir.path().join(source.tile_path(TileCoords::new(3, 4, 5)));
        TileImage::new(4, 4, [255, 0, 0, 255])
            .store_and_clear_encoded_data(&path)
            .expect("pre-populate");

        let cache = TileCache::with_config(source.clone(), fast_config());
        cache.set_cache_directory(dir.path());

        let tile = cache.get_tile(3, 4, 5).expect("lookup");
        assert!(tile.is_some(), "expected a first-call disk hit");
        assert_eq!(cache.tile_count(), 1);
        assert!(cache.contains_path("5/3/4.png"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_coordinates_are_rejected() {
        let source = Arc::new(MockSource::new(Duration::ZERO));
        let cache = TileCache::with_config(source, fast_config());

        let err = cache.get_tile(-1, 0, 0).expect_err("should reject");
        assert!(matches!(err, CacheError::InvalidCoordinates(_)));
        assert_eq!(cache.pending_count(), 0);
    }

    #[test]
    fn test_error_memoization_until_cleared() {
        let coords = TileCoords::new(7, 7, 7);
        let source = Arc::new(MockSource::failing_on(Duration::from_millis(5), coords));
        let cache = TileCache::with_config(source, fast_config());

        assert!(cache.get_tile(7, 7, 7).expect("first lookup").is_none());

        let errored = poll_until(Duration::from_secs(5), || {
            matches!(cache.get_tile(7, 7, 7), Err(CacheError::CorruptTile(_)))
        });
        assert!(errored, "failure was never memoized");
        assert_eq!(cache.stats().errors, 1);

        cache.cancel_pending_requests();
        assert!(cache.get_tile(7, 7, 7).expect("post-clear lookup").is_none());
    }

    #[test]
    fn test_eviction_by_age_with_disk_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = Arc::new(MockSource::new(Duration::from_millis(5)));
        let config = fast_config().with_cache_seconds(1);
        let cache = TileCache::with_config(source.clone(), config);
        cache.set_cache_directory(dir.path());

        assert!(cache.get_tile(1, 1, 1).expect("lookup").is_none());
        assert!(poll_until(Duration::from_secs(5), || {
            matches!(cache.get_tile(1, 1, 1), Ok(Some(_)))
        }));

        // Stop touching the entry and let the sweep age it out.
        assert!(
            poll_until(Duration::from_secs(5), || cache.tile_count() == 0),
            "entry was never evicted"
        );
        assert!(cache.stats().evictions >= 1);

        let artifact = dir.path().join(source.tile_path(TileCoords::new(1, 1, 1)));
        assert!(artifact.exists(), "disk artifact must survive eviction");

        let reloaded = cache.get_tile(1, 1, 1).expect("reload");
        assert!(reloaded.is_some(), "expected an immediate disk reload");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_purge_discards_pending_work() {
        let source = Arc::new(MockSource::new(Duration::from_millis(100)));
        let cache = TileCache::with_config(source.clone(), fast_config());

        for x in 0..100 {
            assert!(cache.get_tile(x, 0, 0).expect("enqueue").is_none());
        }
        cache.purge();

        assert_eq!(cache.pending_count(), 0);
        assert_eq!(cache.tile_count(), 0);

        // Only a load already in flight may still run to completion.
        thread::sleep(Duration::from_millis(400));
        assert!(source.completed.load(Ordering::SeqCst) <= 1);
    }

    #[test]
    fn test_cancel_pending_requests_retains_memory() {
        let source = Arc::new(MockSource::new(Duration::from_millis(5)));
        let cache = TileCache::with_config(source, fast_config());

        assert!(cache.get_tile(2, 2, 2).expect("lookup").is_none());
        assert!(poll_until(Duration::from_secs(5), || {
            matches!(cache.get_tile(2, 2, 2), Ok(Some(_)))
        }));

        cache.cancel_pending_requests();
        assert_eq!(cache.tile_count(), 1);
    }

    #[test]
    fn test_rapid_requests_produce_once() {
        let source = Arc::new(MockSource::new(Duration::from_millis(150)));
        let cache = TileCache::with_config(source.clone(), fast_config());

        for _ in 0..10 {
            let _ = cache.get_tile(5, 5, 5).expect("lookup");
        }
        assert!(cache.pending_count() <= 1);

        assert!(poll_until(Duration::from_secs(5), || {
            matches!(cache.get_tile(5, 5, 5), Ok(Some(_)))
        }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_joins_worker() {
        let source = Arc::new(MockSource::new(Duration::from_millis(200)));
        let cache = TileCache::with_config(source, fast_config());
        for x in 0..3 {
            let _ = cache.get_tile(x, 0, 0);
        }

        let start = Instant::now();
        drop(cache);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_corrupt_disk_file_is_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = Arc::new(MockSource::new(Duration::from_millis(5)));
        let cache = TileCache::with_config(source.clone(), fast_config());
        cache.set_cache_directory(dir.path());

        let artifact = dir.path().join(source.tile_path(TileCoords::new(9, 9, 9)));
        fs::create_dir_all(artifact.parent().unwrap()).expect("dirs");
        fs::write(&artifact, b"definitely not a png").expect("write");

        // The corrupt artifact reads as a miss and is removed, so the
        // producer re-creates it.
        assert!(cache.get_tile(9, 9, 9).expect("lookup").is_none());
        assert!(!artifact.exists());

        assert!(poll_until(Duration::from_secs(5), || {
            matches!(cache.get_tile(9, 9, 9), Ok(Some(_)))
        }));
        assert!(artifact.exists());
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let source = Arc::new(MockSource::new(Duration::from_millis(5)));
        let cache = TileCache::with_config(source, fast_config());

        let _ = cache.get_tile(0, 0, 0);
        assert_eq!(cache.stats().misses, 1);

        assert!(poll_until(Duration::from_secs(5), || {
            matches!(cache.get_tile(0, 0, 0), Ok(Some(_)))
        }));
        let stats = cache.stats();
        assert!(stats.hits >= 1);
        assert_eq!(stats.tile_count, 1);
        assert!(stats.hit_rate() > 0.0);
    }
}
