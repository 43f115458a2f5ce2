//! DistributedStore: liveness kept in a shared key-value server
//!
//! The server does the actual eviction (its `maxmemory-policy`); this store
//! records liveness markers under `{prefix}:evict:{key}` and refreshes their
//! TTL on every read so recently used keys outlive idle ones.
//!
//! Marker values: `"True"` for live keys, `"False"` for keys marked dead
//! and not yet forgotten. A missing marker reads as `Unknown`.

use std::sync::Arc;
use std::time::Duration;

use semcache_core::{CacheKey, EvictionSettings, LivenessState, SemcacheResult};
use tracing::{debug, warn};

use crate::kv::KvBackend;
use crate::store::LivenessStore;

const ALIVE_MARKER: &str = "True";
const DEAD_MARKER: &str = "False";

/// Construction options for `DistributedStore`
#[derive(Debug, Clone)]
pub struct DistributedOptions {
    /// Namespace prefix for marker keys
    pub key_prefix: String,
    /// TTL applied on `put(.., true)` and refreshed on `get`
    pub ttl: Option<Duration>,
    /// Server `maxmemory`, pushed at construction
    pub maxmemory: Option<String>,
    /// Server `maxmemory-policy`, pushed at construction
    pub policy: Option<String>,
}

impl Default for DistributedOptions {
    fn default() -> Self {
        Self {
            key_prefix: "semcache".to_string(),
            ttl: None,
            maxmemory: None,
            policy: None,
        }
    }
}

impl DistributedOptions {
    /// Options from the `[eviction]` section of `semcache.toml`
    pub fn from_settings(settings: &EvictionSettings) -> Self {
        Self {
            key_prefix: settings.key_prefix.clone(),
            ttl: settings.ttl(),
            maxmemory: settings.maxmemory.clone(),
            policy: settings.maxmemory_policy.clone(),
        }
    }
}

/// Liveness store over a `KvBackend`
pub struct DistributedStore {
    backend: Arc<dyn KvBackend>,
    key_prefix: String,
    ttl: Option<Duration>,
    policy: String,
}

impl DistributedStore {
    /// Connect the store, pushing memory settings to the server
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` if a `config_set` fails.
    pub fn new(backend: Arc<dyn KvBackend>, options: DistributedOptions) -> SemcacheResult<Self> {
        if let Some(maxmemory) = &options.maxmemory {
            backend.config_set("maxmemory", maxmemory)?;
        }
        let policy = match &options.policy {
            Some(p) => {
                backend.config_set("maxmemory-policy", p)?;
                p.to_lowercase()
            }
            None => String::new(),
        };
        debug!(prefix = %options.key_prefix, policy = %policy, "distributed store ready");
        Ok(Self {
            backend,
            key_prefix: options.key_prefix,
            ttl: options.ttl,
            policy,
        })
    }

    /// Backend key holding the marker for `key`
    pub fn marker_key(&self, key: &CacheKey) -> String {
        format!("{}:evict:{}", self.key_prefix, key)
    }
}

impl LivenessStore for DistributedStore {
    fn put(&self, keys: &[CacheKey], with_expiry: bool) -> SemcacheResult<Vec<CacheKey>> {
        let ttl = if with_expiry { self.ttl } else { None };
        for key in keys {
            self.backend.set(&self.marker_key(key), ALIVE_MARKER, ttl)?;
        }
        Ok(Vec::new())
    }

    fn get(&self, key: &CacheKey) -> LivenessState {
        let marker = self.marker_key(key);
        match self.backend.get(&marker) {
            Ok(Some(value)) if value == ALIVE_MARKER => {
                if let Some(ttl) = self.ttl {
                    if let Err(e) = self.backend.expire(&marker, ttl) {
                        warn!(key = %key, error = %e, "failed to refresh liveness ttl");
                    }
                }
                LivenessState::Alive
            }
            Ok(Some(_)) => LivenessState::Dead,
            Ok(None) => LivenessState::Unknown,
            Err(e) => {
                warn!(key = %key, error = %e, "liveness lookup failed");
                LivenessState::Unknown
            }
        }
    }

    fn peek(&self, key: &CacheKey) -> LivenessState {
        match self.backend.get(&self.marker_key(key)) {
            Ok(Some(value)) if value == ALIVE_MARKER => LivenessState::Alive,
            Ok(Some(_)) => LivenessState::Dead,
            Ok(None) => LivenessState::Unknown,
            Err(e) => {
                warn!(key = %key, error = %e, "liveness lookup failed");
                LivenessState::Unknown
            }
        }
    }

    fn remove(&self, keys: &[CacheKey]) -> SemcacheResult<()> {
        for key in keys {
            self.backend.set(&self.marker_key(key), DEAD_MARKER, None)?;
        }
        Ok(())
    }

    fn forget(&self, keys: &[CacheKey]) -> SemcacheResult<()> {
        for key in keys {
            self.backend.del(&self.marker_key(key))?;
        }
        Ok(())
    }

    fn policy(&self) -> &str {
        &self.policy
    }
}
