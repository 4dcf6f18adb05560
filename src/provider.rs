//! Worker threads that materialize tiles for a LIFO request queue.
//!
//! A `Provider` consumes `TileId`s from a last-in-first-out queue — the most
//! recent request best reflects the user's current viewport — and populates
//! the shared cache. `StaticProvider` reads from a `TileStore`; `DynamicProvider`
//! invokes a registered procedural generator. Both are built on the same
//! worker-thread shape used elsewhere in this crate: an `Arc<AtomicBool>`
//! cancellation flag, a joinable worker, and a `Drop` impl that stops it.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::cache::{EvictionClass, TileCache};
use crate::error::TileResult;
use crate::ids::TileId;
use crate::tile::{Tile, TileExt};

/// Result of a single tile materialization attempt. Loads never raise; they
/// either succeed or report that the tile cannot exist.
pub enum LoadOutcome {
    Tile(Tile),
    Unavailable,
}

/// The tile-producing half of a provider; `StaticLoader` and `DynamicLoader`
/// below are the two implementations the engine ships.
pub trait Load: Send + Sync + 'static {
    fn load(&self, id: &TileId) -> LoadOutcome;
}

fn eviction_class_for(id: &TileId) -> EvictionClass {
    if id.level == 0 {
        EvictionClass::Immortal
    } else {
        EvictionClass::Mortal
    }
}

struct Queue {
    order: VecDeque<TileId>,
    pending: HashSet<TileId>,
}

impl Queue {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            pending: HashSet::new(),
        }
    }

    /// Push `id`, coalescing with an already-queued duplicate. Returns
    /// whether this enqueue actually added new work.
    fn push(&mut self, id: TileId) -> bool {
        if self.pending.contains(&id) {
            return false;
        }
        self.pending.insert(id.clone());
        self.order.push_back(id);
        true
    }

    /// Pop the most recently pushed id (LIFO).
    fn pop_most_recent(&mut self) -> Option<TileId> {
        let id = self.order.pop_back()?;
        self.pending.remove(&id);
        Some(id)
    }

    fn retain_media(&mut self, keep: impl Fn(&str) -> bool) {
        self.order.retain(|id| keep(&id.media_id));
        self.pending.retain(|id| keep(&id.media_id));
    }

    fn clear(&mut self) {
        self.order.clear();
        self.pending.clear();
    }
}

/// Predicate deciding whether a media_id is still referenced. A load that
/// completes after its media has been purged has its result discarded rather
/// than inserted, since the in-flight load itself cannot be aborted.
pub type ReferencedCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A worker thread consuming a LIFO `TileId` queue and populating `cache`.
pub struct Provider<L: Load> {
    queue: Arc<Mutex<Queue>>,
    queue_signal: Arc<Condvar>,
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    _loader: std::marker::PhantomData<L>,
}

impl<L: Load> Provider<L> {
    pub fn spawn(name: &str, loader: L, cache: Arc<TileCache>) -> Self {
        Self::spawn_with_guard(name, loader, cache, Arc::new(|_: &str| true))
    }

    /// Like [`Provider::spawn`], but a load result is only committed to the
    /// cache if `is_referenced(media_id)` still holds once the load completes
    /// — this is how a `purge` discards the outcome of a load already in flight.
    pub fn spawn_with_guard(name: &str, loader: L, cache: Arc<TileCache>, is_referenced: ReferencedCheck) -> Self {
        let queue = Arc::new(Mutex::new(Queue::new()));
        let queue_signal = Arc::new(Condvar::new());
        let paused = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));

        let worker_queue = Arc::clone(&queue);
        let worker_signal = Arc::clone(&queue_signal);
        let worker_paused = Arc::clone(&paused);
        let worker_stopped = Arc::clone(&stopped);
        let loader = Arc::new(loader);

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                worker_loop(
                    worker_queue,
                    worker_signal,
                    worker_paused,
                    worker_stopped,
                    loader,
                    cache,
                    is_referenced,
                )
            })
            .expect("failed to spawn provider worker");

        Self {
            queue,
            queue_signal,
            paused,
            stopped,
            worker: Mutex::new(Some(handle)),
            _loader: std::marker::PhantomData,
        }
    }

    /// Enqueue a request; O(1). Duplicate enqueues before processing coalesce.
    pub fn enqueue(&self, id: TileId) {
        let mut queue = self.queue.lock();
        queue.push(id);
        self.queue_signal.notify_one();
    }

    /// Drop queued requests matching `media_id` (all requests if `None`).
    /// In-flight loads cannot be aborted; their result is simply discarded
    /// by the caller if the media is no longer referenced.
    pub fn purge(&self, media_id: Option<&str>) {
        let mut queue = self.queue.lock();
        match media_id {
            Some(media_id) => queue.retain_media(|m| m != media_id),
            None => queue.clear(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.queue_signal.notify_all();
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().order.len()
    }
}

impl<L: Load> Drop for Provider<L> {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        self.queue_signal.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop<L: Load>(
    queue: Arc<Mutex<Queue>>,
    queue_signal: Arc<Condvar>,
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    loader: Arc<L>,
    cache: Arc<TileCache>,
    is_referenced: ReferencedCheck,
) {
    loop {
        let id = {
            let mut guard = queue.lock();
            loop {
                if stopped.load(Ordering::Acquire) {
                    return;
                }
                if !paused.load(Ordering::Acquire) {
                    if let Some(id) = guard.pop_most_recent() {
                        break id;
                    }
                }
                queue_signal.wait(&mut guard);
            }
        };

        let outcome = loader.load(&id);
        if !is_referenced(&id.media_id) {
            log::debug!("discarding completed load for purged media: {id}");
            continue;
        }
        let class = eviction_class_for(&id);
        match outcome {
            LoadOutcome::Tile(tile) => cache.insert(id, tile, class),
            LoadOutcome::Unavailable => {
                log::debug!("tile unavailable: {id}");
                cache.insert_tombstone(id, class);
            }
        };
    }
}

/// Loader backing `StaticProvider`: reads tiles persisted in a `TileStore`.
pub struct StaticLoader {
    store: Arc<crate::store::TileStore>,
}

impl StaticLoader {
    pub fn new(store: Arc<crate::store::TileStore>) -> Self {
        Self { store }
    }
}

impl Load for StaticLoader {
    fn load(&self, id: &TileId) -> LoadOutcome {
        let Ok(meta) = self.store.read_metadata(&id.media_id) else {
            return LoadOutcome::Unavailable;
        };
        if !meta.tiled() {
            return LoadOutcome::Unavailable;
        }
        let ext = meta.file_ext().unwrap_or(TileExt::Jpg);
        match self.store.load_tile(id, ext) {
            Ok(tile) => LoadOutcome::Tile(tile),
            Err(_) => LoadOutcome::Unavailable,
        }
    }
}

/// A procedural tile source registered with a `DynamicProvider`.
pub trait TileGenerator: Send + Sync + 'static {
    fn tilesize(&self) -> u32;
    fn file_ext(&self) -> TileExt;
    fn aspect_ratio(&self) -> f64;
    fn max_level(&self) -> Option<u32>;
    /// Produce a tile deterministically: same `(level,row,col)` always
    /// yields the same pixels.
    fn generate(&self, level: u32, row: u32, col: u32) -> TileResult<Tile>;
}

/// Loader backing `DynamicProvider`: invokes a registered generator after
/// validating tile coordinates are in range.
pub struct DynamicLoader {
    generator: Arc<dyn TileGenerator>,
}

impl DynamicLoader {
    pub fn new(generator: Arc<dyn TileGenerator>) -> Self {
        Self { generator }
    }
}

impl Load for DynamicLoader {
    fn load(&self, id: &TileId) -> LoadOutcome {
        if id.level < 0 {
            return LoadOutcome::Unavailable;
        }
        let level = id.level as u32;
        if let Some(max_level) = self.generator.max_level() {
            if level > max_level {
                return LoadOutcome::Unavailable;
            }
        }
        let bound = 1u64 << level;
        if id.row as u64 > bound - 1 || id.col as u64 > bound - 1 {
            return LoadOutcome::Unavailable;
        }
        match self.generator.generate(level, id.row, id.col) {
            Ok(tile) => LoadOutcome::Tile(tile),
            Err(_) => LoadOutcome::Unavailable,
        }
    }
}

pub type StaticProvider = Provider<StaticLoader>;
pub type DynamicProvider = Provider<DynamicLoader>;
