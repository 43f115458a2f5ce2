//! Key-value backend for DistributedStore
//!
//! `KvBackend` is the slice of a networked key-value server that the
//! distributed store needs: SET with optional TTL, GET, EXPIRE, DEL and
//! CONFIG SET. Network clients implement it outside this crate.
//! `MemoryKv` implements the same semantics in-process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use semcache_core::{Clock, SemcacheError, SemcacheResult, SystemClock, Timestamp};

/// Minimal key-value server interface
pub trait KvBackend: Send + Sync {
    /// Store `value` under `key`, expiring after `ttl` when given
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> SemcacheResult<()>;

    /// Value under `key`, if present and not expired
    fn get(&self, key: &str) -> SemcacheResult<Option<String>>;

    /// Reset the expiry of `key`; false if the key does not exist
    fn expire(&self, key: &str, ttl: Duration) -> SemcacheResult<bool>;

    /// Delete `key`; false if it did not exist
    fn del(&self, key: &str) -> SemcacheResult<bool>;

    /// Set a server configuration parameter
    fn config_set(&self, name: &str, value: &str) -> SemcacheResult<()>;
}

struct KvEntry {
    value: String,
    expires_at: Option<Timestamp>,
}

/// In-process `KvBackend`
///
/// Expiry is evaluated lazily against the injected clock. `set_unavailable`
/// makes every call fail with `BackendUnavailable`, standing in for a lost
/// connection.
pub struct MemoryKv {
    entries: Mutex<HashMap<String, KvEntry>>,
    config: Mutex<HashMap<String, String>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    /// Backend on the wall clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Backend reading time from `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config: Mutex::new(HashMap::new()),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Toggle simulated connection loss
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Configuration value previously set with `config_set`
    pub fn config_get(&self, name: &str) -> Option<String> {
        self.config.lock().get(name).cloned()
    }

    /// Number of unexpired keys
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .lock()
            .values()
            .filter(|e| !Self::is_expired(e, now))
            .count()
    }

    /// Check if no unexpired keys remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> SemcacheResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SemcacheError::backend("connection refused"));
        }
        Ok(())
    }

    fn is_expired(entry: &KvEntry, now: Timestamp) -> bool {
        entry.expires_at.map_or(false, |at| at <= now)
    }
}

impl KvBackend for MemoryKv {
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> SemcacheResult<()> {
        self.check()?;
        let expires_at = ttl.map(|t| self.clock.now().saturating_add(t));
        self.entries.lock().insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> SemcacheResult<Option<String>> {
        self.check()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let value = match entries.get(key) {
            Some(e) if !Self::is_expired(e, now) => return Ok(Some(e.value.clone())),
            Some(_) => None,
            None => return Ok(None),
        };
        entries.remove(key);
        Ok(value)
    }

    fn expire(&self, key: &str, ttl: Duration) -> SemcacheResult<bool> {
        self.check()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(e) if !Self::is_expired(e, now) => {
                e.expires_at = Some(now.saturating_add(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn del(&self, key: &str) -> SemcacheResult<bool> {
        self.check()?;
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn config_set(&self, name: &str, value: &str) -> SemcacheResult<()> {
        self.check()?;
        self.config
            .lock()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}
