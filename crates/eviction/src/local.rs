//! LocalStore: in-process liveness with LRU capacity and fixed TTL
//!
//! All state lives under one mutex so the recency order, the expiry index
//! and the tombstone set can never drift apart.
//!
//! - Recency: `BTreeMap<tick, key>`; the smallest tick is the least recently
//!   touched key. `put` and a successful `get` both touch.
//! - Expiry: `BTreeMap<Timestamp, keys>`; expired keys are swept lazily on
//!   every call and become tombstones.
//! - Tombstones: dead keys stay `Dead` until `forget`, so callers can tell a
//!   key that was evicted from one that was never seen.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use semcache_core::{CacheKey, Clock, LivenessState, SemcacheResult, SystemClock, Timestamp};
use tracing::debug;

use crate::store::LivenessStore;

/// Callback receiving keys displaced by capacity or expiry
pub type OnEvict = Box<dyn Fn(&[CacheKey]) + Send + Sync>;

struct Entry {
    tick: u64,
    expires_at: Option<Timestamp>,
}

#[derive(Default)]
struct LocalState {
    live: HashMap<CacheKey, Entry>,
    recency: BTreeMap<u64, CacheKey>,
    expiry: BTreeMap<Timestamp, HashSet<CacheKey>>,
    dead: HashSet<CacheKey>,
    next_tick: u64,
}

impl LocalState {
    fn tick(&mut self) -> u64 {
        let t = self.next_tick;
        self.next_tick += 1;
        t
    }

    fn unlink(&mut self, key: &CacheKey) -> bool {
        let Some(entry) = self.live.remove(key) else {
            return false;
        };
        self.recency.remove(&entry.tick);
        if let Some(at) = entry.expires_at {
            if let Some(keys) = self.expiry.get_mut(&at) {
                keys.remove(key);
                if keys.is_empty() {
                    self.expiry.remove(&at);
                }
            }
        }
        true
    }

    fn touch(&mut self, key: &CacheKey) {
        let tick = self.tick();
        if let Some(entry) = self.live.get_mut(key) {
            let old = std::mem::replace(&mut entry.tick, tick);
            self.recency.remove(&old);
            self.recency.insert(tick, key.clone());
        }
    }

    fn kill(&mut self, key: &CacheKey) {
        self.unlink(key);
        self.dead.insert(key.clone());
    }

    /// Tombstone every key whose expiry is at or before `now`
    fn sweep(&mut self, now: Timestamp) -> Vec<CacheKey> {
        let due: Vec<Timestamp> = self.expiry.range(..=now).map(|(at, _)| *at).collect();
        let mut expired = Vec::new();
        for at in due {
            if let Some(keys) = self.expiry.remove(&at) {
                expired.extend(keys);
            }
        }
        for key in &expired {
            if let Some(entry) = self.live.remove(key) {
                self.recency.remove(&entry.tick);
            }
            self.dead.insert(key.clone());
        }
        expired
    }
}

/// In-process liveness store
pub struct LocalStore {
    state: Mutex<LocalState>,
    /// Max live keys; 0 = unbounded
    capacity: usize,
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
    on_evict: Option<OnEvict>,
    policy: String,
}

impl LocalStore {
    /// Create a store; `capacity == 0` disables LRU eviction
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self::with_clock(capacity, ttl, Arc::new(SystemClock))
    }

    /// Create a store reading time from `clock`
    pub fn with_clock(capacity: usize, ttl: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        let policy = match (capacity > 0, ttl.is_some()) {
            (true, true) => "lru+ttl",
            (true, false) => "lru",
            (false, true) => "ttl",
            (false, false) => "manual",
        };
        Self {
            state: Mutex::new(LocalState::default()),
            capacity,
            ttl,
            clock,
            on_evict: None,
            policy: policy.to_string(),
        }
    }

    /// Builder: report displaced keys to `f`
    pub fn with_on_evict(mut self, f: impl Fn(&[CacheKey]) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Box::new(f));
        self
    }

    /// Number of live keys
    pub fn live_count(&self) -> usize {
        let mut state = self.state.lock();
        let expired = state.sweep(self.clock.now());
        let n = state.live.len();
        drop(state);
        self.report(&expired);
        n
    }

    /// Number of tombstoned keys
    pub fn dead_count(&self) -> usize {
        self.state.lock().dead.len()
    }

    fn report(&self, displaced: &[CacheKey]) {
        if displaced.is_empty() {
            return;
        }
        debug!(count = displaced.len(), "local store displaced keys");
        if let Some(f) = &self.on_evict {
            f(displaced);
        }
    }
}

impl LivenessStore for LocalStore {
    fn put(&self, keys: &[CacheKey], with_expiry: bool) -> SemcacheResult<Vec<CacheKey>> {
        let now = self.clock.now();
        let expires_at = match (with_expiry, self.ttl) {
            (true, Some(ttl)) => Some(now.saturating_add(ttl)),
            _ => None,
        };

        let mut state = self.state.lock();
        let mut displaced = state.sweep(now);
        for key in keys {
            state.unlink(key);
            state.dead.remove(key);

            if self.capacity > 0 && state.live.len() >= self.capacity {
                if let Some((_, victim)) = state.recency.pop_first() {
                    state.kill(&victim);
                    displaced.push(victim);
                }
            }

            let tick = state.tick();
            state.recency.insert(tick, key.clone());
            if let Some(at) = expires_at {
                state.expiry.entry(at).or_default().insert(key.clone());
            }
            state.live.insert(key.clone(), Entry { tick, expires_at });
        }
        drop(state);

        // A key put and displaced within the same call is still reported
        self.report(&displaced);
        Ok(displaced)
    }

    fn get(&self, key: &CacheKey) -> LivenessState {
        let mut state = self.state.lock();
        let expired = state.sweep(self.clock.now());
        let liveness = if state.live.contains_key(key) {
            state.touch(key);
            LivenessState::Alive
        } else if state.dead.contains(key) {
            LivenessState::Dead
        } else {
            LivenessState::Unknown
        };
        drop(state);
        self.report(&expired);
        liveness
    }

    fn peek(&self, key: &CacheKey) -> LivenessState {
        let state = self.state.lock();
        let now = self.clock.now();
        match state.live.get(key) {
            Some(entry) if entry.expires_at.map_or(true, |at| at > now) => LivenessState::Alive,
            Some(_) => LivenessState::Dead,
            None if state.dead.contains(key) => LivenessState::Dead,
            None => LivenessState::Unknown,
        }
    }

    fn remove(&self, keys: &[CacheKey]) -> SemcacheResult<()> {
        let mut state = self.state.lock();
        for key in keys {
            state.kill(key);
        }
        Ok(())
    }

    fn forget(&self, keys: &[CacheKey]) -> SemcacheResult<()> {
        let mut state = self.state.lock();
        for key in keys {
            state.dead.remove(key);
        }
        Ok(())
    }

    fn policy(&self) -> &str {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semcache_core::ManualClock;

    fn keys(names: &[&str]) -> Vec<CacheKey> {
        names.iter().map(|n| CacheKey::from(*n)).collect()
    }

    #[test]
    fn test_put_get_remove() {
        let store = LocalStore::new(0, None);
        let k = keys(&["a", "b"]);
        store.put(&k, false).unwrap();
        assert_eq!(store.get(&k[0]), LivenessState::Alive);

        store.remove(&k[..1]).unwrap();
        assert_eq!(store.get(&k[0]), LivenessState::Dead);
        assert_eq!(store.get(&k[1]), LivenessState::Alive);
        assert_eq!(store.get(&CacheKey::from("never")), LivenessState::Unknown);

        store.forget(&k[..1]).unwrap();
        assert_eq!(store.get(&k[0]), LivenessState::Unknown);
    }

    #[test]
    fn test_lru_evicts_least_recently_touched() {
        let store = LocalStore::new(2, None);
        let k = keys(&["a", "b", "c"]);
        store.put(&k[..2], false).unwrap();
        // touch "a" so "b" is the oldest
        assert!(store.get(&k[0]).is_alive());

        let displaced = store.put(&k[2..], false).unwrap();
        assert_eq!(displaced, keys(&["b"]));
        assert_eq!(store.get(&k[1]), LivenessState::Dead);
        assert!(store.get(&k[0]).is_alive());
        assert!(store.get(&k[2]).is_alive());
        assert_eq!(store.live_count(), 2);
    }

    #[test]
    fn test_reput_does_not_evict() {
        let store = LocalStore::new(2, None);
        let k = keys(&["a", "b"]);
        store.put(&k, false).unwrap();
        assert!(store.put(&k[..1], false).unwrap().is_empty());
        assert_eq!(store.live_count(), 2);
    }

    #[test]
    fn test_on_evict_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let store = LocalStore::new(1, None)
            .with_on_evict(move |ks| sink.lock().extend_from_slice(ks));
        store.put(&keys(&["a"]), false).unwrap();
        store.put(&keys(&["b"]), false).unwrap();
        assert_eq!(*seen.lock(), keys(&["a"]));
    }

    #[test]
    fn test_ttl_expiry() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(100)));
        let store = LocalStore::with_clock(0, Some(Duration::from_secs(10)), clock.clone());
        let k = keys(&["a", "b"]);
        store.put(&k[..1], true).unwrap();
        store.put(&k[1..], false).unwrap();

        clock.advance(Duration::from_secs(9));
        assert!(store.get(&k[0]).is_alive());
        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get(&k[0]), LivenessState::Dead);
        // no expiry requested
        assert!(store.get(&k[1]).is_alive());
    }

    #[test]
    fn test_put_refreshes_expiry() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(0)));
        let store = LocalStore::with_clock(0, Some(Duration::from_secs(10)), clock.clone());
        let k = keys(&["a"]);
        store.put(&k, true).unwrap();
        clock.advance(Duration::from_secs(8));
        store.put(&k, true).unwrap();
        clock.advance(Duration::from_secs(8));
        assert!(store.get(&k[0]).is_alive());
    }

    #[test]
    fn test_put_revives_dead_key() {
        let store = LocalStore::new(0, None);
        let k = keys(&["a"]);
        store.put(&k, false).unwrap();
        store.remove(&k).unwrap();
        store.put(&k, false).unwrap();
        assert!(store.get(&k[0]).is_alive());
        assert_eq!(store.dead_count(), 0);
    }

    #[test]
    fn test_peek_does_not_touch() {
        let store = LocalStore::new(2, None);
        let k = keys(&["a", "b", "c"]);
        store.put(&k[..2], false).unwrap();
        assert!(store.peek(&k[0]).is_alive());

        // "a" is still the least recently touched
        assert_eq!(store.put(&k[2..], false).unwrap(), keys(&["a"]));
        assert_eq!(store.peek(&k[0]), LivenessState::Dead);
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(LocalStore::new(10, None).policy(), "lru");
        assert_eq!(LocalStore::new(0, Some(Duration::from_secs(1))).policy(), "ttl");
        assert_eq!(LocalStore::new(3, Some(Duration::from_secs(1))).policy(), "lru+ttl");
    }
}
