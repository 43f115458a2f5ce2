//! LivenessStore trait
//!
//! A liveness store is the key → liveness ledger of the cache. The index
//! never deletes rows; a key leaves search results as soon as its store
//! reports it as anything other than `Alive`, and leaves the index at the
//! next rebuild.

use semcache_core::{CacheKey, LivenessState, SemcacheResult};

/// Key → liveness ledger
///
/// Implementations do their own locking and are shared across threads.
pub trait LivenessStore: Send + Sync {
    /// Mark `keys` alive
    ///
    /// With `with_expiry` and a configured TTL, the expiry is set (or
    /// refreshed). Returns keys that lost their place because of capacity
    /// limits; those are now `Dead`.
    fn put(&self, keys: &[CacheKey], with_expiry: bool) -> SemcacheResult<Vec<CacheKey>>;

    /// Liveness of `key`
    ///
    /// Never fails: a store that cannot answer reports `Unknown`.
    fn get(&self, key: &CacheKey) -> LivenessState;

    /// Liveness of `key` without counting as an access
    ///
    /// Stores that refresh recency or TTL on `get` skip that here.
    fn peek(&self, key: &CacheKey) -> LivenessState {
        self.get(key)
    }

    /// Mark `keys` dead
    fn remove(&self, keys: &[CacheKey]) -> SemcacheResult<()>;

    /// Drop all record of `keys` once a rebuild has compacted them out
    fn forget(&self, keys: &[CacheKey]) -> SemcacheResult<()>;

    /// Policy name; empty when the store does no eviction of its own
    fn policy(&self) -> &str;

    /// Whether `get` reflects real liveness
    ///
    /// False for stores that leave eviction to someone else; their
    /// `Unknown` answers carry no information.
    fn tracks_liveness(&self) -> bool {
        true
    }
}
