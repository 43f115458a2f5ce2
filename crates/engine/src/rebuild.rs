//! RebuildPipeline: compaction by rebuild-and-swap
//!
//! The graph cannot delete rows, so dead keys are dropped by building a new
//! index from the keys that are still live and swapping it in.
//!
//! ## Phases
//!
//! 1. Open the replay log (under the writer lock). From here on every insert
//!    is also appended to the log.
//! 2. Snapshot live keys from the durable source and build a fresh index in
//!    chunks, checking the cancel flag between chunks. No lock is held.
//! 3. Under the writer lock: drain the log into the fresh index, persist it
//!    when a snapshot path is configured, swap it in.
//! 4. Forget compacted keys in the liveness store and clear dead marks of
//!    keys that were kept because the store reported them alive.
//!
//! A failure in phases 2-3 closes the log and leaves the old index active.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use semcache_core::{CacheKey, IndexSettings, RebuildSettings, SemcacheError, SemcacheResult};
use semcache_eviction::EvictionCoordinator;
use semcache_index::{ActiveIndex, KeyedIndex};
use tracing::{debug, info, warn};

use crate::source::DurableSource;

/// Result of one rebuild request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// A fresh index was swapped in
    Completed {
        /// Generation number of the new index
        generation: u64,
        /// Keys carried over from the durable source
        kept: usize,
        /// Keys of the old index absent from the new one
        dropped: usize,
        /// Inserts replayed from the log
        replayed: usize,
    },
    /// Another rebuild was already running
    Skipped,
}

/// Rebuilds and swaps the active index
pub struct RebuildPipeline {
    chunk_size: usize,
    snapshot_path: Option<PathBuf>,
    running: Mutex<()>,
    replay: Mutex<Option<Vec<(CacheKey, Vec<f32>)>>>,
    cancel: AtomicBool,
}

impl RebuildPipeline {
    /// Pipeline inserting `chunk_size` rows between cancellation checks
    pub fn new(chunk_size: usize, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            snapshot_path,
            running: Mutex::new(()),
            replay: Mutex::new(None),
            cancel: AtomicBool::new(false),
        }
    }

    /// Pipeline configured from `semcache.toml`
    pub fn from_settings(rebuild: &RebuildSettings, index: &IndexSettings) -> Self {
        Self::new(rebuild.chunk_size, index.snapshot_path.clone())
    }

    /// Whether a rebuild is in flight
    pub fn is_running(&self) -> bool {
        self.running.is_locked()
    }

    /// Ask the running rebuild to stop at its next chunk boundary
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Log an insert for replay if a rebuild is in flight
    ///
    /// Must be called while holding the writer lock that `rebuild` takes.
    pub fn record_insert(&self, key: &CacheKey, vector: &[f32]) {
        if let Some(log) = self.replay.lock().as_mut() {
            log.push((key.clone(), vector.to_vec()));
        }
    }

    /// Rebuild `active` from the live keys of `source`
    ///
    /// `writer` is the lock every insert holds while touching the index.
    ///
    /// # Errors
    ///
    /// `RebuildAbandoned` if the rebuild failed; the previous index stays
    /// active.
    pub fn rebuild(
        &self,
        active: &ActiveIndex,
        writer: &Mutex<()>,
        source: &dyn DurableSource,
        coordinator: &EvictionCoordinator,
    ) -> SemcacheResult<RebuildOutcome> {
        let Some(_running) = self.running.try_lock() else {
            debug!("rebuild already running, request skipped");
            return Ok(RebuildOutcome::Skipped);
        };
        self.cancel.store(false, Ordering::SeqCst);

        {
            let _writer = writer.lock();
            *self.replay.lock() = Some(Vec::new());
        }
        let dead_at_start = coordinator.dead_keys();

        let (mut index, kept) = match self.build(active, source, coordinator) {
            Ok(built) => built,
            Err(e) => return Err(self.abandon(e)),
        };

        let writer_guard = writer.lock();
        let log = self.replay.lock().take().unwrap_or_default();
        let mut replayed = 0;
        for (key, vector) in log {
            if let Ok(current) = index.vector_of(&key) {
                if current == vector {
                    continue;
                }
            }
            if let Err(e) = index.insert(key, &vector) {
                drop(writer_guard);
                return Err(self.abandon(e));
            }
            replayed += 1;
        }
        if let Some(path) = &self.snapshot_path {
            if let Err(e) = index.persist(path) {
                drop(writer_guard);
                return Err(self.abandon(e));
            }
        }

        let current = active.load();
        let mut compacted: Vec<CacheKey> = current
            .read()
            .keys()
            .filter(|k| !index.contains_key(k))
            .cloned()
            .collect();
        let dropped = compacted.len();
        let (kept_dead, gone_dead): (Vec<CacheKey>, Vec<CacheKey>) = dead_at_start
            .into_iter()
            .partition(|k| index.contains_key(k));
        compacted.extend(gone_dead);
        compacted.sort();
        compacted.dedup();

        active.swap(index);
        let generation = active.generation();
        drop(writer_guard);

        if let Err(e) = coordinator.forget(&compacted) {
            warn!(error = %e, keys = compacted.len(), "failed to forget compacted keys");
        }
        // Kept despite a dead mark: the store answered alive during the build
        let revived = coordinator.revive(&kept_dead);
        if revived > 0 {
            debug!(revived, "dead marks cleared for keys the store reports alive");
        }

        info!(generation, kept, dropped, replayed, "rebuild completed");
        Ok(RebuildOutcome::Completed {
            generation,
            kept,
            dropped,
            replayed,
        })
    }

    fn build(
        &self,
        active: &ActiveIndex,
        source: &dyn DurableSource,
        coordinator: &EvictionCoordinator,
    ) -> SemcacheResult<(KeyedIndex, usize)> {
        let mut index = active.load().read().empty_like();
        let live: Vec<CacheKey> = source
            .keys()?
            .into_iter()
            .filter(|k| coordinator.survives_rebuild(k))
            .collect();
        debug!(live = live.len(), "rebuild snapshot taken");

        for chunk in live.chunks(self.chunk_size) {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(SemcacheError::RebuildAbandoned("cancelled".to_string()));
            }
            let mut entries = Vec::with_capacity(chunk.len());
            for key in chunk {
                // Keys can vanish from the source between keys() and get()
                if let Some(vector) = source.get(key)? {
                    entries.push((key.clone(), vector));
                }
            }
            index.insert_batch(&entries)?;
        }
        let kept = index.len();
        Ok((index, kept))
    }

    fn abandon(&self, cause: SemcacheError) -> SemcacheError {
        *self.replay.lock() = None;
        warn!(error = %cause, "rebuild abandoned, previous index stays active");
        match cause {
            SemcacheError::RebuildAbandoned(_) => cause,
            other => SemcacheError::RebuildAbandoned(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use semcache_eviction::LocalStore;
    use semcache_index::IndexConfig;
    use std::sync::Arc;

    struct Fixture {
        active: ActiveIndex,
        writer: Mutex<()>,
        source: MemorySource,
        coordinator: EvictionCoordinator,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                active: ActiveIndex::new(KeyedIndex::new(IndexConfig::new(2)).unwrap()),
                writer: Mutex::new(()),
                source: MemorySource::new(),
                coordinator: EvictionCoordinator::new(
                    Arc::new(LocalStore::new(0, None)),
                    &RebuildSettings::default(),
                ),
            }
        }

        fn insert(&self, pipeline: &RebuildPipeline, key: &str, vector: [f32; 2]) {
            let key = CacheKey::from(key);
            let _w = self.writer.lock();
            self.source.put(&key, &vector).unwrap();
            self.active.load().write().insert(key.clone(), &vector).unwrap();
            pipeline.record_insert(&key, &vector);
            self.coordinator.admit(&[key]).unwrap();
        }

        fn rebuild(&self, pipeline: &RebuildPipeline) -> SemcacheResult<RebuildOutcome> {
            pipeline.rebuild(&self.active, &self.writer, &self.source, &self.coordinator)
        }
    }

    #[test]
    fn test_rebuild_drops_dead_keys() {
        let f = Fixture::new();
        let p = RebuildPipeline::new(2, None);
        for (i, k) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            f.insert(&p, k, [i as f32, 0.0]);
        }
        f.coordinator
            .mark_evicted(&[CacheKey::from("b"), CacheKey::from("d")])
            .unwrap();

        let outcome = f.rebuild(&p).unwrap();
        assert_eq!(
            outcome,
            RebuildOutcome::Completed {
                generation: 1,
                kept: 3,
                dropped: 2,
                replayed: 0,
            }
        );
        let current = f.active.load();
        assert!(!current.read().contains_key(&CacheKey::from("b")));
        assert_eq!(current.read().len(), 3);
        assert_eq!(f.coordinator.dead_count(), 0);
    }

    #[test]
    fn test_rebuild_removes_superseded_rows() {
        let f = Fixture::new();
        let p = RebuildPipeline::new(16, None);
        f.insert(&p, "a", [1.0, 0.0]);
        f.insert(&p, "a", [0.0, 1.0]);
        assert_eq!(f.active.load().read().superseded(), 1);

        f.rebuild(&p).unwrap();
        let current = f.active.load();
        let index = current.read();
        assert_eq!(index.rows(), 1);
        assert_eq!(index.vector_of(&CacheKey::from("a")).unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_source_failure_keeps_old_index() {
        let f = Fixture::new();
        let p = RebuildPipeline::new(1, None);
        for k in ["a", "b", "c"] {
            f.insert(&p, k, [1.0, 1.0]);
        }
        f.coordinator.mark_evicted(&[CacheKey::from("a")]).unwrap();
        f.source.fail_reads_after(2);

        let err = f.rebuild(&p).unwrap_err();
        assert!(matches!(err, SemcacheError::RebuildAbandoned(_)));
        assert_eq!(f.active.generation(), 0);
        assert_eq!(f.active.load().read().len(), 3);
        // still counted dead, retried next time
        assert_eq!(f.coordinator.dead_count(), 1);

        f.source.heal();
        assert!(matches!(
            f.rebuild(&p).unwrap(),
            RebuildOutcome::Completed { kept: 2, .. }
        ));
    }

    /// Source that cancels the pipeline on its first vector read
    struct CancellingSource {
        inner: MemorySource,
        pipeline: Arc<RebuildPipeline>,
    }

    impl DurableSource for CancellingSource {
        fn keys(&self) -> SemcacheResult<Vec<CacheKey>> {
            self.inner.keys()
        }

        fn get(&self, key: &CacheKey) -> SemcacheResult<Option<Vec<f32>>> {
            self.pipeline.cancel();
            self.inner.get(key)
        }

        fn put(&self, key: &CacheKey, vector: &[f32]) -> SemcacheResult<()> {
            self.inner.put(key, vector)
        }
    }

    #[test]
    fn test_cancel_between_chunks() {
        let f = Fixture::new();
        let p = Arc::new(RebuildPipeline::new(1, None));
        let source = CancellingSource {
            inner: MemorySource::new(),
            pipeline: Arc::clone(&p),
        };
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            let key = CacheKey::from(*k);
            source.put(&key, &[i as f32, 0.0]).unwrap();
            f.active.load().write().insert(key.clone(), &[i as f32, 0.0]).unwrap();
            f.coordinator.admit(&[key]).unwrap();
        }

        let err = p
            .rebuild(&f.active, &f.writer, &source, &f.coordinator)
            .unwrap_err();
        assert!(matches!(err, SemcacheError::RebuildAbandoned(ref reason) if reason == "cancelled"));
        assert_eq!(f.active.generation(), 0);
        assert!(p.replay.lock().is_none());
    }

    #[test]
    fn test_stale_cancel_flag_is_cleared() {
        let f = Fixture::new();
        let p = RebuildPipeline::new(1, None);
        f.insert(&p, "a", [1.0, 0.0]);
        p.cancel();
        assert!(f.rebuild(&p).is_ok());
    }

    /// Source that performs one cache insert in the middle of a rebuild
    struct InterleavingSource {
        inner: MemorySource,
        active: Arc<ActiveIndex>,
        writer: Arc<Mutex<()>>,
        pipeline: Arc<RebuildPipeline>,
        fired: AtomicBool,
    }

    impl DurableSource for InterleavingSource {
        fn keys(&self) -> SemcacheResult<Vec<CacheKey>> {
            self.inner.keys()
        }

        fn get(&self, key: &CacheKey) -> SemcacheResult<Option<Vec<f32>>> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                let late = CacheKey::from("late");
                let _w = self.writer.lock();
                self.inner.put(&late, &[0.0, 9.0])?;
                self.active.load().write().insert(late.clone(), &[0.0, 9.0])?;
                self.pipeline.record_insert(&late, &[0.0, 9.0]);
            }
            self.inner.get(key)
        }

        fn put(&self, key: &CacheKey, vector: &[f32]) -> SemcacheResult<()> {
            self.inner.put(key, vector)
        }
    }

    #[test]
    fn test_insert_during_rebuild_is_replayed() {
        let active = Arc::new(ActiveIndex::new(KeyedIndex::new(IndexConfig::new(2)).unwrap()));
        let writer = Arc::new(Mutex::new(()));
        let pipeline = Arc::new(RebuildPipeline::new(1, None));
        let coordinator =
            EvictionCoordinator::new(Arc::new(LocalStore::new(0, None)), &RebuildSettings::default());
        let source = InterleavingSource {
            inner: MemorySource::new(),
            active: Arc::clone(&active),
            writer: Arc::clone(&writer),
            pipeline: Arc::clone(&pipeline),
            fired: AtomicBool::new(false),
        };
        for k in ["a", "b"] {
            let key = CacheKey::from(k);
            source.inner.put(&key, &[1.0, 0.0]).unwrap();
            active.load().write().insert(key.clone(), &[1.0, 0.0]).unwrap();
            coordinator.admit(&[key]).unwrap();
        }
        // "late" is admitted before the swap; its liveness is not what
        // keeps it, the log is
        coordinator.admit(&[CacheKey::from("late")]).unwrap();

        let outcome = pipeline
            .rebuild(&active, &writer, &source, &coordinator)
            .unwrap();
        assert!(matches!(
            outcome,
            RebuildOutcome::Completed { kept: 2, replayed: 1, .. }
        ));
        let current = active.load();
        assert_eq!(
            current.read().vector_of(&CacheKey::from("late")).unwrap(),
            vec![0.0, 9.0]
        );
    }

    #[test]
    fn test_snapshot_includes_replayed_inserts() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache.index");
        let active = Arc::new(ActiveIndex::new(KeyedIndex::new(IndexConfig::new(2)).unwrap()));
        let writer = Arc::new(Mutex::new(()));
        let pipeline = Arc::new(RebuildPipeline::new(1, Some(path.clone())));
        let coordinator =
            EvictionCoordinator::new(Arc::new(LocalStore::new(0, None)), &RebuildSettings::default());
        let source = InterleavingSource {
            inner: MemorySource::new(),
            active: Arc::clone(&active),
            writer: Arc::clone(&writer),
            pipeline: Arc::clone(&pipeline),
            fired: AtomicBool::new(false),
        };
        let key = CacheKey::from("a");
        source.inner.put(&key, &[1.0, 0.0]).unwrap();
        active.load().write().insert(key.clone(), &[1.0, 0.0]).unwrap();
        coordinator.admit(&[key, CacheKey::from("late")]).unwrap();

        pipeline
            .rebuild(&active, &writer, &source, &coordinator)
            .unwrap();
        let loaded = KeyedIndex::load(&path, 2).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.vector_of(&CacheKey::from("late")).unwrap(),
            vec![0.0, 9.0]
        );
    }

    #[test]
    fn test_kept_keys_lose_stale_dead_marks() {
        let f = Fixture::new();
        let p = RebuildPipeline::new(2, None);
        f.insert(&p, "a", [1.0, 0.0]);
        f.insert(&p, "b", [0.0, 1.0]);
        f.insert(&p, "c", [1.0, 1.0]);
        f.coordinator.mark_evicted(&[CacheKey::from("c")]).unwrap();
        // Counted dead while the store could not be asked
        f.coordinator
            .note_dead(&[CacheKey::from("a"), CacheKey::from("b")]);
        assert_eq!(f.coordinator.dead_count(), 3);

        let outcome = f.rebuild(&p).unwrap();
        assert!(matches!(
            outcome,
            RebuildOutcome::Completed { kept: 2, dropped: 1, .. }
        ));
        assert_eq!(f.coordinator.dead_count(), 0);
    }

    #[test]
    fn test_skipped_while_running() {
        let f = Fixture::new();
        let p = RebuildPipeline::new(1, None);
        let _held = p.running.lock();
        assert!(p.is_running());
        assert_eq!(f.rebuild(&p).unwrap(), RebuildOutcome::Skipped);
    }

    #[test]
    fn test_record_insert_only_while_rebuilding() {
        let p = RebuildPipeline::new(1, None);
        p.record_insert(&CacheKey::from("a"), &[1.0]);
        assert!(p.replay.lock().is_none());

        *p.replay.lock() = Some(Vec::new());
        p.record_insert(&CacheKey::from("a"), &[1.0]);
        assert_eq!(p.replay.lock().as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn test_rebuild_persists_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache.index");
        let f = Fixture::new();
        let p = RebuildPipeline::new(4, Some(path.clone()));
        f.insert(&p, "a", [1.0, 0.0]);
        f.insert(&p, "b", [0.0, 1.0]);

        f.rebuild(&p).unwrap();
        let loaded = KeyedIndex::load(&path, 2).unwrap();
        assert_eq!(loaded.len(), 2);
    }
}
