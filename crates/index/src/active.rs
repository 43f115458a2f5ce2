//! ActiveIndex: the swappable handle to the live KeyedIndex
//!
//! Readers `load()` the current generation wait-free and keep it for the
//! duration of their query; a swap publishes a new generation with one
//! atomic store and never disturbs a query already running on the old one.
//!
//! Inside a generation the index sits behind a `RwLock`: inserts take the
//! write lock and searches the read lock, so a row becomes visible only once
//! the heap, graph and key tables are all updated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

use crate::keyed::KeyedIndex;

/// One published index instance
pub struct IndexGeneration {
    generation: u64,
    index: RwLock<KeyedIndex>,
}

impl IndexGeneration {
    fn new(generation: u64, index: KeyedIndex) -> Self {
        Self {
            generation,
            index: RwLock::new(index),
        }
    }

    /// Monotonic generation number (0 for the initial index)
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Shared access for searches
    pub fn read(&self) -> RwLockReadGuard<'_, KeyedIndex> {
        self.index.read()
    }

    /// Exclusive access for inserts
    pub fn write(&self) -> RwLockWriteGuard<'_, KeyedIndex> {
        self.index.write()
    }
}

/// Atomically swappable index handle
pub struct ActiveIndex {
    current: ArcSwap<IndexGeneration>,
    next_generation: AtomicU64,
}

impl ActiveIndex {
    /// Publish `index` as generation 0
    pub fn new(index: KeyedIndex) -> Self {
        Self {
            current: ArcSwap::from_pointee(IndexGeneration::new(0, index)),
            next_generation: AtomicU64::new(1),
        }
    }

    /// The generation serving queries right now
    pub fn load(&self) -> Arc<IndexGeneration> {
        self.current.load_full()
    }

    /// Current generation number
    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    /// Replace the live index, returning the retired generation
    ///
    /// Callers that must not lose concurrent inserts hold the writer lock of
    /// the cache across replay and swap.
    pub fn swap(&self, index: KeyedIndex) -> Arc<IndexGeneration> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let rows = index.rows();
        let retired = self
            .current
            .swap(Arc::new(IndexGeneration::new(generation, index)));
        info!(
            generation,
            retired = retired.generation,
            rows,
            "active index swapped"
        );
        retired
    }
}
