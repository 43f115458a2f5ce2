//! semcache - retrieval core for a semantic cache
//!
//! semcache stores embeddings of cached prompts in an approximate
//! nearest-neighbor index and answers "what have we cached that is close to
//! this?" while an eviction policy decides which entries are still live.
//!
//! # Quick Start
//!
//! ```ignore
//! use semcache::{CacheKey, SemanticCache, SemcacheConfig};
//!
//! let config = SemcacheConfig::from_file("semcache.toml".as_ref())?;
//! let cache = SemanticCache::open(config)?;
//!
//! cache.insert(CacheKey::from("prompt:42"), &embedding)?;
//! let hits = cache.search(&query_embedding, 1)?;
//! ```
//!
//! # Architecture
//!
//! The HNSW graph cannot delete rows. Evictions only mark keys dead in the
//! liveness store; search filters them out, and once enough rows are dead a
//! rebuild builds a fresh index from the durable source and swaps it in.

pub use semcache_core::{
    CacheKey, Clock, DistanceMetric, EvictionSettings, IndexSettings, LivenessState, ManualClock,
    PolicyKind, RebuildSettings, SemcacheConfig, SemcacheError, SemcacheResult, SystemClock,
    Timestamp, CONFIG_FILE_NAME,
};
pub use semcache_engine::{
    DurableSource, Embedder, MemorySource, RebuildOutcome, RebuildPipeline, RebuildScheduler,
    SearchHit, SemanticCache, SemanticCacheBuilder,
};
pub use semcache_eviction::{
    DistributedOptions, DistributedStore, EvictionCoordinator, EvictionPolicy, KvBackend,
    LivenessStore, LocalStore, MemoryKv, NoOpStore,
};
pub use semcache_index::{ActiveIndex, IndexConfig, KeyedIndex, RowId, VectorIndexEngine};
