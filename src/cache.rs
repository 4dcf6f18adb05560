//! Thread-safe, two-class in-memory tile cache.
//!
//! Level-0 ("immortal") tiles are the roots synthesis walks up from to build
//! every other tile, so they are kept until explicitly removed rather than
//! aged out by LRU. All other tiles ("mortal") are bounded by an LRU budget.
//! A tombstone entry (`value: None`) records that a tile is known not to
//! exist, so repeated misses don't repeatedly hit the store or a provider.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::ReentrantMutex;

use crate::ids::TileId;
use crate::tile::Tile;

/// Why a cached entry is exempt from, or subject to, LRU eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionClass {
    /// Never evicted by the LRU sweep; removed only explicitly (e.g. media deletion).
    Immortal,
    /// Subject to ordinary least-recently-used eviction.
    Mortal,
}

#[derive(Clone)]
struct CacheEntry {
    /// `None` marks a tombstone: this tile is known to be unavailable.
    value: Option<Tile>,
    eviction_class: EvictionClass,
    access_count: u64,
}

impl CacheEntry {
    fn size_bytes(&self) -> usize {
        match &self.value {
            Some(tile) => tile.as_raw().len(),
            None => 0,
        }
    }
}

/// Snapshot of cache activity and occupancy.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size_bytes: usize,
    pub num_tiles: usize,
    pub num_tombstones: usize,
}

/// A looked-up cache value: a real tile, a recorded absence (tombstone), or
/// nothing known at all.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Tile(Tile),
    Tombstone,
    Miss,
}

/// Concurrent LRU tile cache with an immortal class and tombstone support.
///
/// The LRU queue is guarded by a [`ReentrantMutex`] because cache methods are
/// invoked recursively: a provider worker holding the queue lock during
/// eviction may itself call back into the cache (e.g. to check an ancestor
/// tile) from the same thread while walking the synthesis chain.
pub struct TileCache {
    entries: DashMap<TileId, CacheEntry>,
    mortal_lru: ReentrantMutex<RefCell<VecDeque<TileId>>>,
    max_bytes: usize,
    current_bytes: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TileCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            mortal_lru: ReentrantMutex::new(RefCell::new(VecDeque::new())),
            max_bytes,
            current_bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, id: &TileId) -> Lookup {
        let Some(mut entry) = self.entries.get_mut(id) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss;
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        entry.access_count += 1;
        let result = match &entry.value {
            Some(tile) => Lookup::Tile(tile.clone()),
            None => Lookup::Tombstone,
        };
        if entry.eviction_class == EvictionClass::Mortal {
            drop(entry);
            self.touch_mortal(id);
        }
        result
    }

    pub fn contains(&self, id: &TileId) -> bool {
        self.entries.contains_key(id)
    }

    fn touch_mortal(&self, id: &TileId) {
        let guard = self.mortal_lru.lock();
        let mut lru = guard.borrow_mut();
        if let Some(pos) = lru.iter().position(|existing| existing == id) {
            lru.remove(pos);
        }
        lru.push_back(id.clone());
    }

    pub fn insert(&self, id: TileId, tile: Tile, eviction_class: EvictionClass) {
        let entry = CacheEntry {
            value: Some(tile),
            eviction_class,
            access_count: 0,
        };
        self.insert_entry(id, entry);
    }

    /// Record that `id` is known to be unavailable, short-circuiting future lookups.
    pub fn insert_tombstone(&self, id: TileId, eviction_class: EvictionClass) {
        let entry = CacheEntry {
            value: None,
            eviction_class,
            access_count: 0,
        };
        self.insert_entry(id, entry);
    }

    fn insert_entry(&self, id: TileId, entry: CacheEntry) {
        let new_size = entry.size_bytes();
        if entry.eviction_class == EvictionClass::Mortal {
            self.evict_mortal_if_needed(new_size);
        }

        if let Some(old) = self.entries.insert(id.clone(), entry) {
            self.current_bytes.fetch_sub(old.size_bytes(), Ordering::Relaxed);
        }
        self.current_bytes.fetch_add(new_size, Ordering::Relaxed);

        if self.entries.get(&id).map(|e| e.eviction_class) == Some(EvictionClass::Mortal) {
            self.touch_mortal(&id);
        }
    }

    fn evict_mortal_if_needed(&self, incoming_size: usize) {
        let target = self.max_bytes.saturating_sub(incoming_size);
        while self.current_bytes.load(Ordering::Relaxed) > target {
            let victim = {
                let guard = self.mortal_lru.lock();
                guard.borrow_mut().pop_front()
            };
            let Some(victim) = victim else { break };
            if let Some((_, entry)) = self.entries.remove(&victim) {
                self.current_bytes.fetch_sub(entry.size_bytes(), Ordering::Relaxed);
            }
        }
    }

    pub fn remove(&self, id: &TileId) {
        if let Some((_, entry)) = self.entries.remove(id) {
            self.current_bytes.fetch_sub(entry.size_bytes(), Ordering::Relaxed);
        }
        let guard = self.mortal_lru.lock();
        let mut lru = guard.borrow_mut();
        if let Some(pos) = lru.iter().position(|existing| existing == id) {
            lru.remove(pos);
        }
    }

    /// Remove every cached entry (tiles and tombstones) for a given media_id,
    /// e.g. after re-conversion or deletion.
    pub fn remove_matching(&self, media_id: &str) {
        let doomed: Vec<TileId> = self
            .entries
            .iter()
            .filter(|e| e.key().media_id == media_id)
            .map(|e| e.key().clone())
            .collect();
        for id in doomed {
            self.remove(&id);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let num_tombstones = self.entries.iter().filter(|e| e.value.is_none()).count();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size_bytes: self.current_bytes.load(Ordering::Relaxed),
            num_tiles: self.entries.len(),
            num_tombstones,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached entry, immortal or mortal. Used for a full purge.
    pub fn clear(&self) {
        self.entries.clear();
        self.current_bytes.store(0, Ordering::Relaxed);
        let guard = self.mortal_lru.lock();
        guard.borrow_mut().clear();
    }
}
