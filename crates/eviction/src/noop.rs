//! NoOpStore: eviction managed entirely outside the cache

use semcache_core::{CacheKey, LivenessState, SemcacheResult};

use crate::store::LivenessStore;

/// Store that records nothing
///
/// Used when the backing database evicts on its own. Every key reads as
/// `Unknown`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpStore;

impl NoOpStore {
    /// Create a no-op store
    pub fn new() -> Self {
        NoOpStore
    }
}

impl LivenessStore for NoOpStore {
    fn put(&self, _keys: &[CacheKey], _with_expiry: bool) -> SemcacheResult<Vec<CacheKey>> {
        Ok(Vec::new())
    }

    fn get(&self, _key: &CacheKey) -> LivenessState {
        LivenessState::Unknown
    }

    fn remove(&self, _keys: &[CacheKey]) -> SemcacheResult<()> {
        Ok(())
    }

    fn forget(&self, _keys: &[CacheKey]) -> SemcacheResult<()> {
        Ok(())
    }

    fn policy(&self) -> &str {
        ""
    }

    fn tracks_liveness(&self) -> bool {
        false
    }
}
