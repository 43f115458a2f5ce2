//! Durable (key, vector) source
//!
//! The rebuild pipeline rereads every cached embedding from here, so the
//! source must outlive any index instance. Production deployments back it
//! with their own storage; `MemorySource` keeps everything in a `DashMap`.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use semcache_core::{CacheKey, SemcacheError, SemcacheResult};

/// Authoritative store of cached embeddings
pub trait DurableSource: Send + Sync {
    /// Every key currently stored
    fn keys(&self) -> SemcacheResult<Vec<CacheKey>>;

    /// Vector stored under `key`
    fn get(&self, key: &CacheKey) -> SemcacheResult<Option<Vec<f32>>>;

    /// Store `vector` under `key`, replacing any previous vector
    fn put(&self, key: &CacheKey, vector: &[f32]) -> SemcacheResult<()>;
}

/// In-memory `DurableSource`
///
/// `fail_reads_after(n)` lets the next `n` reads succeed and fails every
/// read after that, simulating storage that dies mid-rebuild.
pub struct MemorySource {
    entries: DashMap<CacheKey, Vec<f32>>,
    read_budget: AtomicUsize,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    /// Empty source
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            read_budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// Number of stored vectors
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fail every read after the next `n`
    pub fn fail_reads_after(&self, n: usize) {
        self.read_budget.store(n, Ordering::SeqCst);
    }

    /// Stop failing reads
    pub fn heal(&self) {
        self.read_budget.store(usize::MAX, Ordering::SeqCst);
    }

    fn charge_read(&self) -> SemcacheResult<()> {
        let spent = self
            .read_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| match budget {
                usize::MAX => Some(usize::MAX),
                0 => None,
                n => Some(n - 1),
            });
        match spent {
            Ok(_) => Ok(()),
            Err(_) => Err(SemcacheError::backend("durable source read failed")),
        }
    }
}

impl DurableSource for MemorySource {
    fn keys(&self) -> SemcacheResult<Vec<CacheKey>> {
        self.charge_read()?;
        let mut keys: Vec<CacheKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    fn get(&self, key: &CacheKey) -> SemcacheResult<Option<Vec<f32>>> {
        self.charge_read()?;
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &CacheKey, vector: &[f32]) -> SemcacheResult<()> {
        self.entries.insert(key.clone(), vector.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_keys() {
        let source = MemorySource::new();
        source.put(&CacheKey::from("b"), &[2.0]).unwrap();
        source.put(&CacheKey::from("a"), &[1.0]).unwrap();
        source.put(&CacheKey::from("a"), &[1.5]).unwrap();

        assert_eq!(source.len(), 2);
        assert_eq!(
            source.keys().unwrap(),
            vec![CacheKey::from("a"), CacheKey::from("b")]
        );
        assert_eq!(source.get(&CacheKey::from("a")).unwrap(), Some(vec![1.5]));
        assert_eq!(source.get(&CacheKey::from("zz")).unwrap(), None);
    }

    #[test]
    fn test_fail_reads_after() {
        let source = MemorySource::new();
        source.put(&CacheKey::from("a"), &[1.0]).unwrap();
        source.fail_reads_after(2);

        assert!(source.keys().is_ok());
        assert!(source.get(&CacheKey::from("a")).is_ok());
        assert!(source.get(&CacheKey::from("a")).is_err());
        // writes are unaffected
        assert!(source.put(&CacheKey::from("b"), &[2.0]).is_ok());

        source.heal();
        assert!(source.keys().is_ok());
    }
}
