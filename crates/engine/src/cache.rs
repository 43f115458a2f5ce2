//! SemanticCache: the retrieval core facade
//!
//! Ties the active index, the durable source, the eviction coordinator and
//! the rebuild pipeline together.
//!
//! ## Write path
//!
//! Under the writer lock: the vector goes to the durable source, then to
//! the active index, then to the replay log if a rebuild is in flight. The
//! key is then admitted in the liveness store.
//!
//! ## Read path
//!
//! Lock-free load of the active generation, shared lock on its index, ANN
//! search, then every hit is checked against the liveness store. Dead and
//! unknown keys are dropped (and counted toward the rebuild threshold).

use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use semcache_core::{
    CacheKey, Clock, PolicyKind, SemcacheConfig, SemcacheError, SemcacheResult, SystemClock,
};
use semcache_eviction::{EvictionCoordinator, EvictionPolicy, KvBackend};
use semcache_index::{ActiveIndex, IndexConfig, KeyedIndex, RowId};
use tracing::{debug, info, warn};

use crate::background::RebuildScheduler;
use crate::rebuild::{RebuildOutcome, RebuildPipeline};
use crate::source::{DurableSource, MemorySource};

/// Turns text into embeddings
pub trait Embedder: Send + Sync {
    /// Embed `text`
    fn embed(&self, text: &str) -> SemcacheResult<Vec<f32>>;

    /// Length of every embedding this embedder returns
    fn dimension(&self) -> usize;
}

/// A live cached entry near the query
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Cache key of the entry
    pub key: CacheKey,
    /// Distance to the query (lower = nearer)
    pub distance: f32,
}

struct CacheCore {
    active: ActiveIndex,
    writer: Mutex<()>,
    source: Arc<dyn DurableSource>,
    coordinator: EvictionCoordinator,
    pipeline: RebuildPipeline,
}

impl CacheCore {
    fn rebuild(&self) -> SemcacheResult<RebuildOutcome> {
        self.pipeline
            .rebuild(&self.active, &self.writer, self.source.as_ref(), &self.coordinator)
    }
}

/// Builder for `SemanticCache`
///
/// ```ignore
/// let cache = SemanticCache::builder(SemcacheConfig::from_file(path)?)
///     .source(my_source)
///     .embedder(my_embedder)
///     .open()?;
/// ```
pub struct SemanticCacheBuilder {
    config: SemcacheConfig,
    source: Option<Arc<dyn DurableSource>>,
    backend: Option<Arc<dyn KvBackend>>,
    clock: Arc<dyn Clock>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl SemanticCacheBuilder {
    /// Builder with `config` and in-memory defaults
    pub fn new(config: SemcacheConfig) -> Self {
        Self {
            config,
            source: None,
            backend: None,
            clock: Arc::new(SystemClock),
            embedder: None,
        }
    }

    /// Durable source to rebuild from
    ///
    /// Defaults to a `MemorySource` seeded with the loaded snapshot, if any.
    pub fn source(mut self, source: Arc<dyn DurableSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Key-value backend for the distributed policy
    pub fn backend(mut self, backend: Arc<dyn KvBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Clock for TTL bookkeeping
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Embedder for the text entry points
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Open the cache
    ///
    /// Loads the index snapshot when `index.snapshot_path` exists, otherwise
    /// starts empty. Without an explicit source, the snapshot's keys and
    /// vectors seed an in-memory one.
    ///
    /// # Errors
    ///
    /// `Config` for invalid settings, `DimensionMismatch` if the embedder
    /// disagrees with the index dimension, plus any snapshot load or backend
    /// error.
    pub fn open(self) -> SemcacheResult<SemanticCache> {
        let config = self.config;
        config.validate()?;

        if let Some(embedder) = &self.embedder {
            if embedder.dimension() != config.index.dimension {
                return Err(SemcacheError::dimension(
                    config.index.dimension,
                    embedder.dimension(),
                ));
            }
        }

        let policy = EvictionPolicy::from_settings(&config.eviction);
        let store = policy.build(self.backend, self.clock)?;
        let coordinator = EvictionCoordinator::new(store, &config.rebuild);

        let index = match &config.index.snapshot_path {
            Some(path) if path.exists() => {
                let index = KeyedIndex::load(path, config.index.dimension)?;
                // A process-local ledger starts empty; everything in the
                // snapshot was live when it was written.
                if policy.kind() == PolicyKind::Local {
                    let keys: Vec<CacheKey> = index.keys().cloned().collect();
                    coordinator.admit(&keys)?;
                }
                index
            }
            _ => KeyedIndex::new(IndexConfig::from_settings(&config.index))?,
        };

        let source: Arc<dyn DurableSource> = match self.source {
            Some(source) => source,
            None => {
                // Rebuilds read from here; without it a loaded snapshot
                // would compact down to nothing.
                let seeded = MemorySource::new();
                for key in index.keys() {
                    seeded.put(key, &index.vector_of(key)?)?;
                }
                Arc::new(seeded)
            }
        };

        let core = Arc::new(CacheCore {
            active: ActiveIndex::new(index),
            writer: Mutex::new(()),
            source,
            coordinator,
            pipeline: RebuildPipeline::from_settings(&config.rebuild, &config.index),
        });

        let scheduler = if config.rebuild.background {
            let weak: Weak<CacheCore> = Arc::downgrade(&core);
            let scheduler = RebuildScheduler::spawn(move || {
                if let Some(core) = weak.upgrade() {
                    // Failures are logged by the pipeline
                    let _ = core.rebuild();
                }
            })?;
            let trigger = scheduler.trigger();
            core.coordinator.set_rebuild_signal(move || {
                trigger.request();
            });
            Some(scheduler)
        } else {
            None
        };

        info!(
            dimension = config.index.dimension,
            policy = ?policy.kind(),
            rows = core.active.load().read().rows(),
            background = config.rebuild.background,
            "semantic cache opened"
        );
        Ok(SemanticCache {
            core,
            config,
            scheduler,
            embedder: self.embedder,
            closed: false,
        })
    }
}

/// Semantic cache retrieval core
pub struct SemanticCache {
    core: Arc<CacheCore>,
    config: SemcacheConfig,
    scheduler: Option<RebuildScheduler>,
    embedder: Option<Arc<dyn Embedder>>,
    closed: bool,
}

impl SemanticCache {
    /// Start building a cache from `config`
    pub fn builder(config: SemcacheConfig) -> SemanticCacheBuilder {
        SemanticCacheBuilder::new(config)
    }

    /// In-memory cache with default collaborators
    pub fn open(config: SemcacheConfig) -> SemcacheResult<Self> {
        Self::builder(config).open()
    }

    /// Configuration the cache was opened with
    pub fn config(&self) -> &SemcacheConfig {
        &self.config
    }

    /// Embedding dimension
    pub fn dimension(&self) -> usize {
        self.config.index.dimension
    }

    /// Liveness policy name (empty for no-op)
    pub fn policy(&self) -> &str {
        self.core.coordinator.store().policy()
    }

    /// Distinct keys in the active index (dead ones included until rebuild)
    pub fn len(&self) -> usize {
        self.core.active.load().read().len()
    }

    /// Check if the active index holds no keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows in the active index, superseded ones included
    pub fn rows(&self) -> usize {
        self.core.active.load().read().rows()
    }

    /// Generation of the active index
    pub fn generation(&self) -> u64 {
        self.core.active.generation()
    }

    /// Dead keys awaiting compaction
    pub fn dead_count(&self) -> usize {
        self.core.coordinator.dead_count()
    }

    /// Cache `vector` under `key`
    ///
    /// Re-inserting a key replaces its vector.
    pub fn insert(&self, key: CacheKey, vector: &[f32]) -> SemcacheResult<RowId> {
        let row = {
            let _writer = self.core.writer.lock();
            let generation = self.core.active.load();
            let mut index = generation.write();
            index.engine().check_dimension(vector)?;
            self.core.source.put(&key, vector)?;
            let row = index.insert(key.clone(), vector)?;
            self.core.pipeline.record_insert(&key, vector);
            row
        };
        self.core.coordinator.admit(std::slice::from_ref(&key))?;
        self.maybe_rebuild();
        Ok(row)
    }

    /// Cache many `(key, vector)` pairs
    ///
    /// All vectors are validated before anything is written.
    pub fn insert_batch(&self, entries: &[(CacheKey, Vec<f32>)]) -> SemcacheResult<Vec<RowId>> {
        let rows = {
            let _writer = self.core.writer.lock();
            let generation = self.core.active.load();
            let mut index = generation.write();
            for (_, vector) in entries {
                index.engine().check_dimension(vector)?;
            }
            for (key, vector) in entries {
                self.core.source.put(key, vector)?;
            }
            let rows = index.insert_batch(entries)?;
            for (key, vector) in entries {
                self.core.pipeline.record_insert(key, vector);
            }
            rows
        };
        let keys: Vec<CacheKey> = entries.iter().map(|(k, _)| k.clone()).collect();
        self.core.coordinator.admit(&keys)?;
        debug!(count = rows.len(), "batch cached");
        self.maybe_rebuild();
        Ok(rows)
    }

    /// Up to `k` live entries nearest to `query`
    ///
    /// Counts as an access for every returned key (TTL refresh, LRU touch).
    pub fn search(&self, query: &[f32], k: usize) -> SemcacheResult<Vec<SearchHit>> {
        let generation = self.core.active.load();
        let candidates = {
            let index = generation.read();
            let fetch = k.saturating_add(self.core.coordinator.dead_count());
            index.search(query, fetch)?
        };

        let mut hits = Vec::with_capacity(k.min(candidates.len()));
        let mut discovered = Vec::new();
        for candidate in candidates {
            if hits.len() == k {
                break;
            }
            if self.core.coordinator.is_live(&candidate.key) {
                hits.push(SearchHit {
                    key: candidate.key,
                    distance: candidate.distance,
                });
            } else if !self.core.coordinator.is_dead(&candidate.key) {
                discovered.push(candidate.key);
            }
        }

        if !discovered.is_empty() {
            let newly = self.core.coordinator.note_dead(&discovered);
            debug!(newly, "search found expired keys");
            self.maybe_rebuild();
        }
        Ok(hits)
    }

    /// `search` with the configured `index.top_k`
    pub fn nearest(&self, query: &[f32]) -> SemcacheResult<Vec<SearchHit>> {
        self.search(query, self.config.index.top_k)
    }

    /// Embed `text` and cache it under `key`
    pub fn insert_text(&self, key: CacheKey, text: &str) -> SemcacheResult<RowId> {
        let vector = self.embed(text)?;
        self.insert(key, &vector)
    }

    /// Embed `text` and search for it
    pub fn search_text(&self, text: &str, k: usize) -> SemcacheResult<Vec<SearchHit>> {
        let vector = self.embed(text)?;
        self.search(&vector, k)
    }

    fn embed(&self, text: &str) -> SemcacheResult<Vec<f32>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| SemcacheError::Config("no embedder configured".to_string()))?;
        let vector = embedder.embed(text)?;
        if vector.len() != self.dimension() {
            return Err(SemcacheError::dimension(self.dimension(), vector.len()));
        }
        Ok(vector)
    }

    /// Stored vector of a live `key`
    pub fn get_vector(&self, key: &CacheKey) -> SemcacheResult<Vec<f32>> {
        if !self.core.coordinator.is_live(key) {
            return Err(SemcacheError::KeyNotFound {
                key: key.to_string(),
            });
        }
        self.core.active.load().read().vector_of(key)
    }

    /// Evict `keys`; their rows disappear from results immediately and from
    /// the index at the next rebuild
    ///
    /// Returns how many keys were newly evicted.
    pub fn evict(&self, keys: &[CacheKey]) -> SemcacheResult<usize> {
        let newly = self.core.coordinator.mark_evicted(keys)?;
        if newly > 0 {
            self.maybe_rebuild();
        }
        Ok(newly)
    }

    /// Whether the dead-row ratio has reached the rebuild threshold
    pub fn rebuild_due(&self) -> bool {
        let (dead, total) = self.dead_and_total();
        self.core.coordinator.should_rebuild(dead, total)
    }

    /// Rebuild now on the calling thread
    pub fn rebuild(&self) -> SemcacheResult<RebuildOutcome> {
        self.core.rebuild()
    }

    /// Ask the background worker for a rebuild (or run one inline when
    /// background rebuilds are disabled)
    pub fn request_rebuild(&self) -> SemcacheResult<()> {
        match &self.scheduler {
            Some(scheduler) => {
                scheduler.request();
                Ok(())
            }
            None => self.rebuild().map(|_| ()),
        }
    }

    /// Wait for queued background rebuilds to finish
    pub fn wait_for_rebuilds(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.drain();
        }
    }

    /// Cancel an in-flight rebuild at its next chunk boundary
    pub fn cancel_rebuild(&self) {
        self.core.pipeline.cancel();
    }

    fn dead_and_total(&self) -> (usize, usize) {
        let generation = self.core.active.load();
        let index = generation.read();
        (
            self.core.coordinator.dead_count() + index.superseded(),
            index.rows(),
        )
    }

    fn maybe_rebuild(&self) {
        let (dead, total) = self.dead_and_total();
        let due = self.core.coordinator.evaluate(dead, total);
        if due && self.scheduler.is_none() {
            if let Err(e) = self.core.rebuild() {
                warn!(error = %e, "inline rebuild failed");
            }
        }
    }

    /// Persist the active index to `index.snapshot_path`, if configured
    pub fn flush(&self) -> SemcacheResult<()> {
        match &self.config.index.snapshot_path {
            Some(path) => self.persist_to(path),
            None => Ok(()),
        }
    }

    /// Persist the active index to `path`
    pub fn persist_to(&self, path: &Path) -> SemcacheResult<()> {
        let generation = self.core.active.load();
        let index = generation.read();
        index.persist(path)
    }

    /// Stop background work and flush
    pub fn close(mut self) -> SemcacheResult<()> {
        self.closed = true;
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown();
        }
        self.flush()
    }
}

impl Drop for SemanticCache {
    fn drop(&mut self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown();
        }
        if !self.closed {
            if let Err(e) = self.flush() {
                warn!(error = %e, "flush on drop failed");
            }
        }
    }
}
