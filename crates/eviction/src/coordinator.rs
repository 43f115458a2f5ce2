//! EvictionCoordinator: dead-key bookkeeping and the rebuild trigger
//!
//! Per key: `Live → Dead → Forgotten`. The coordinator moves keys to `Dead`
//! through the liveness store, counts them, and decides when the index has
//! accumulated enough dead rows to be worth rebuilding. It never touches the
//! index itself; `forget` is called by whoever completed the rebuild.
//!
//! The dead set lock is never held across a store call.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use semcache_core::{CacheKey, LivenessState, RebuildSettings, SemcacheResult};
use tracing::debug;

use crate::store::LivenessStore;

/// Callback fired when a rebuild becomes worthwhile
pub type RebuildSignal = Box<dyn Fn() + Send + Sync>;

/// Tracks evicted keys and decides when to compact
pub struct EvictionCoordinator {
    store: Arc<dyn LivenessStore>,
    dead: Mutex<HashSet<CacheKey>>,
    dead_ratio_threshold: f64,
    min_dead: usize,
    signal: RwLock<Option<RebuildSignal>>,
}

impl EvictionCoordinator {
    /// Coordinator over `store` with thresholds from `settings`
    pub fn new(store: Arc<dyn LivenessStore>, settings: &RebuildSettings) -> Self {
        Self {
            store,
            dead: Mutex::new(HashSet::new()),
            dead_ratio_threshold: settings.dead_ratio_threshold,
            min_dead: settings.min_dead,
            signal: RwLock::new(None),
        }
    }

    /// Install the callback fired by `evaluate`
    pub fn set_rebuild_signal(&self, signal: impl Fn() + Send + Sync + 'static) {
        *self.signal.write() = Some(Box::new(signal));
    }

    /// The liveness store
    pub fn store(&self) -> &Arc<dyn LivenessStore> {
        &self.store
    }

    /// Liveness of `key` as the store reports it
    pub fn liveness(&self, key: &CacheKey) -> LivenessState {
        self.store.get(key)
    }

    /// Whether `key` may be served
    ///
    /// `Alive` keys are served; `Dead` never. `Unknown` is served only when
    /// the store does not track liveness and the key was not marked dead
    /// here.
    pub fn is_live(&self, key: &CacheKey) -> bool {
        self.servable(self.store.get(key), key)
    }

    /// Like `is_live`, without counting as an access (no TTL or recency
    /// refresh); used when sweeping every key for a rebuild
    pub fn survives_rebuild(&self, key: &CacheKey) -> bool {
        self.servable(self.store.peek(key), key)
    }

    fn servable(&self, state: LivenessState, key: &CacheKey) -> bool {
        match state {
            LivenessState::Alive => true,
            LivenessState::Dead => false,
            LivenessState::Unknown => !self.store.tracks_liveness() && !self.is_dead(key),
        }
    }

    /// Record `keys` as live after an insert
    ///
    /// Keys the store displaced to make room are counted as dead.
    pub fn admit(&self, keys: &[CacheKey]) -> SemcacheResult<()> {
        let displaced = self.store.put(keys, true)?;
        let mut dead = self.dead.lock();
        for key in keys {
            dead.remove(key);
        }
        dead.extend(displaced);
        Ok(())
    }

    /// Mark `keys` dead in the store
    ///
    /// Idempotent: returns how many keys became dead with this call. Keys
    /// already counted dead are still written to the store, since a dead
    /// mark taken from an unreachable store says nothing about its contents.
    pub fn mark_evicted(&self, keys: &[CacheKey]) -> SemcacheResult<usize> {
        let mut seen = HashSet::new();
        let fresh: Vec<CacheKey> = keys.iter().filter(|k| seen.insert(*k)).cloned().collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        self.store.remove(&fresh)?;
        let mut dead = self.dead.lock();
        let newly = fresh.into_iter().filter(|k| dead.insert(k.clone())).count();
        debug!(newly, dead = dead.len(), "keys marked evicted");
        Ok(newly)
    }

    /// Count keys the store already reports dead (expired or evicted by
    /// the backend) without writing to the store
    pub fn note_dead(&self, keys: &[CacheKey]) -> usize {
        let mut dead = self.dead.lock();
        keys.iter().filter(|k| dead.insert((*k).clone())).count()
    }

    /// Clear dead marks of `keys` the store now reports servable
    ///
    /// Returns how many marks were cleared. Keys the store still reports
    /// dead or unknown stay counted.
    pub fn revive(&self, keys: &[CacheKey]) -> usize {
        let alive: Vec<&CacheKey> = keys
            .iter()
            .filter(|k| self.store.peek(k).is_alive())
            .collect();
        let mut dead = self.dead.lock();
        alive.into_iter().filter(|k| dead.remove(*k)).count()
    }

    /// Whether `key` is counted dead
    pub fn is_dead(&self, key: &CacheKey) -> bool {
        self.dead.lock().contains(key)
    }

    /// Number of dead keys awaiting compaction
    pub fn dead_count(&self) -> usize {
        self.dead.lock().len()
    }

    /// Snapshot of dead keys awaiting compaction
    pub fn dead_keys(&self) -> Vec<CacheKey> {
        self.dead.lock().iter().cloned().collect()
    }

    /// `total > 0 && dead >= min_dead && dead / total >= threshold`
    pub fn should_rebuild(&self, dead: usize, total: usize) -> bool {
        if total == 0 || dead < self.min_dead {
            return false;
        }
        dead as f64 / total as f64 >= self.dead_ratio_threshold
    }

    /// Check the trigger against `dead` and `total` rows, firing the
    /// rebuild signal when it holds
    pub fn evaluate(&self, dead: usize, total: usize) -> bool {
        let due = self.should_rebuild(dead, total);
        if due {
            debug!(dead, total, "rebuild threshold reached");
            if let Some(signal) = self.signal.read().as_ref() {
                signal();
            }
        }
        due
    }

    /// Drop compacted keys from the store and the dead count
    pub fn forget(&self, keys: &[CacheKey]) -> SemcacheResult<()> {
        self.store.forget(keys)?;
        let mut dead = self.dead.lock();
        for key in keys {
            dead.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn keys(names: &[&str]) -> Vec<CacheKey> {
        names.iter().map(|n| CacheKey::from(*n)).collect()
    }

    fn coordinator() -> EvictionCoordinator {
        EvictionCoordinator::new(
            Arc::new(LocalStore::new(0, None)),
            &RebuildSettings::default(),
        )
    }

    #[test]
    fn test_mark_evicted_is_idempotent() {
        let c = coordinator();
        c.admit(&keys(&["a", "b", "c"])).unwrap();

        assert_eq!(c.mark_evicted(&keys(&["b", "b"])).unwrap(), 1);
        assert_eq!(c.mark_evicted(&keys(&["b"])).unwrap(), 0);
        assert_eq!(c.dead_count(), 1);
        assert_eq!(c.liveness(&CacheKey::from("b")), LivenessState::Dead);
        assert!(c.liveness(&CacheKey::from("a")).is_alive());
    }

    #[test]
    fn test_revive_clears_only_alive_keys() {
        let c = coordinator();
        c.admit(&keys(&["a", "b"])).unwrap();
        c.mark_evicted(&keys(&["b"])).unwrap();
        // "a" counted dead without the store agreeing, "ghost" never stored
        c.note_dead(&keys(&["a", "ghost"]));
        assert_eq!(c.dead_count(), 3);

        assert_eq!(c.revive(&keys(&["a", "b", "ghost"])), 1);
        assert!(!c.is_dead(&CacheKey::from("a")));
        assert!(c.is_dead(&CacheKey::from("b")));
        assert!(c.is_dead(&CacheKey::from("ghost")));
        assert_eq!(c.revive(&keys(&["a"])), 0);
    }

    #[test]
    fn test_mark_evicted_writes_store_for_noted_keys() {
        let c = coordinator();
        c.admit(&keys(&["a"])).unwrap();
        c.note_dead(&keys(&["a"]));
        assert!(c.liveness(&CacheKey::from("a")).is_alive());

        assert_eq!(c.mark_evicted(&keys(&["a"])).unwrap(), 0);
        assert_eq!(c.liveness(&CacheKey::from("a")), LivenessState::Dead);
        assert_eq!(c.revive(&keys(&["a"])), 0);
    }

    #[test]
    fn test_should_rebuild_threshold() {
        let c = coordinator();
        assert!(!c.should_rebuild(0, 0));
        assert!(!c.should_rebuild(1, 0));
        assert!(!c.should_rebuild(0, 10));
        assert!(!c.should_rebuild(1, 10));
        assert!(c.should_rebuild(2, 10));
        assert!(c.should_rebuild(10, 10));
    }

    #[test]
    fn test_min_dead_floor() {
        let settings = RebuildSettings {
            min_dead: 5,
            ..Default::default()
        };
        let c = EvictionCoordinator::new(Arc::new(LocalStore::new(0, None)), &settings);
        assert!(!c.should_rebuild(4, 4));
        assert!(c.should_rebuild(5, 20));
    }

    #[test]
    fn test_forget_resets_count() {
        let c = coordinator();
        c.admit(&keys(&["a", "b"])).unwrap();
        c.mark_evicted(&keys(&["a", "b"])).unwrap();
        c.forget(&keys(&["a"])).unwrap();
        assert_eq!(c.dead_count(), 1);
        assert_eq!(c.liveness(&CacheKey::from("a")), LivenessState::Unknown);
    }

    #[test]
    fn test_admit_counts_displaced_keys() {
        let c = EvictionCoordinator::new(
            Arc::new(LocalStore::new(2, None)),
            &RebuildSettings::default(),
        );
        c.admit(&keys(&["a", "b", "c"])).unwrap();
        assert_eq!(c.dead_count(), 1);
        assert!(c.is_dead(&CacheKey::from("a")));
    }

    #[test]
    fn test_readmit_clears_dead_mark() {
        let c = coordinator();
        c.admit(&keys(&["a"])).unwrap();
        c.mark_evicted(&keys(&["a"])).unwrap();
        c.admit(&keys(&["a"])).unwrap();
        assert_eq!(c.dead_count(), 0);
        assert!(c.liveness(&CacheKey::from("a")).is_alive());
    }

    #[test]
    fn test_evaluate_fires_signal() {
        let c = coordinator();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        c.set_rebuild_signal(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!c.evaluate(1, 100));
        assert!(c.evaluate(30, 100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_is_live() {
        let c = coordinator();
        c.admit(&keys(&["a", "b"])).unwrap();
        c.mark_evicted(&keys(&["b"])).unwrap();
        assert!(c.is_live(&CacheKey::from("a")));
        assert!(!c.is_live(&CacheKey::from("b")));
        assert!(!c.is_live(&CacheKey::from("never")));
    }

    #[test]
    fn test_is_live_without_tracking_store() {
        let c = EvictionCoordinator::new(
            Arc::new(crate::noop::NoOpStore::new()),
            &RebuildSettings::default(),
        );
        c.admit(&keys(&["a", "b"])).unwrap();
        c.mark_evicted(&keys(&["b"])).unwrap();
        assert!(c.is_live(&CacheKey::from("a")));
        assert!(!c.is_live(&CacheKey::from("b")));
    }

    #[test]
    fn test_note_dead() {
        let c = coordinator();
        assert_eq!(c.note_dead(&keys(&["x", "y", "x"])), 2);
        assert_eq!(c.note_dead(&keys(&["x"])), 0);
    }
}
