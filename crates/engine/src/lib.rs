//! Semantic cache engine
//!
//! This crate orchestrates the index and eviction layers:
//! - SemanticCache: the facade with insert, search, evict, flush and close
//! - RebuildPipeline: compaction by rebuild-and-swap with a replay log
//! - RebuildScheduler: background worker that runs requested rebuilds
//! - DurableSource: the authoritative key → vector store rebuilds read from
//!
//! The engine is the only component that knows about:
//! - The writer lock shared by inserts and the rebuild swap
//! - When dead rows justify a rebuild

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod cache;
pub mod rebuild;
pub mod source;

pub use background::{RebuildScheduler, RebuildTrigger, SchedulerStats};
pub use cache::{Embedder, SearchHit, SemanticCache, SemanticCacheBuilder};
pub use rebuild::{RebuildOutcome, RebuildPipeline};
pub use source::{DurableSource, MemorySource};
