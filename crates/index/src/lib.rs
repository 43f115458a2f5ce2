//! Vector index for semcache
//!
//! This crate provides the approximate-nearest-neighbor side of the cache:
//!
//! - **VectorIndexEngine**: HNSW graph over a contiguous row heap; add,
//!   batch add, top-K search, reconstruct, persist/load
//! - **KeyedIndex**: engine plus the row ↔ CacheKey tables for one instance
//! - **ActiveIndex**: atomically swappable handle to the live KeyedIndex
//!
//! The graph has no deletion. Rows leave the index only when a rebuild
//! produces a fresh instance without them.

pub mod active;
pub mod distance;
pub mod engine;
pub mod heap;
pub mod hnsw;
pub mod keyed;
pub mod snapshot;

pub use active::{ActiveIndex, IndexGeneration};
pub use engine::{IndexConfig, VectorIndexEngine};
pub use heap::{RowHeap, RowId};
pub use hnsw::HnswParams;
pub use keyed::{KeyedHit, KeyedIndex};
pub use snapshot::{INDEX_SNAPSHOT_MAGIC, INDEX_SNAPSHOT_VERSION};
