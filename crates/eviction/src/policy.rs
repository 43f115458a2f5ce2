//! EvictionPolicy: which liveness store backs the cache
//!
//! The policy is fixed at construction from configuration.

use std::sync::Arc;
use std::time::Duration;

use semcache_core::{Clock, EvictionSettings, PolicyKind, SemcacheError, SemcacheResult};

use crate::distributed::{DistributedOptions, DistributedStore};
use crate::kv::KvBackend;
use crate::local::LocalStore;
use crate::noop::NoOpStore;
use crate::store::LivenessStore;

/// Eviction policy with its parameters
#[derive(Debug, Clone)]
pub enum EvictionPolicy {
    /// Eviction handled outside the cache
    NoOp,
    /// In-process LRU capacity and TTL
    Local {
        /// Max live keys; 0 = unbounded
        capacity: usize,
        /// Fixed time-to-live
        ttl: Option<Duration>,
    },
    /// Backend-native eviction with TTL refresh on access
    Distributed(DistributedOptions),
}

impl EvictionPolicy {
    /// Policy described by the `[eviction]` section
    pub fn from_settings(settings: &EvictionSettings) -> Self {
        match settings.policy {
            PolicyKind::NoOp => EvictionPolicy::NoOp,
            PolicyKind::Local => EvictionPolicy::Local {
                capacity: settings.capacity,
                ttl: settings.ttl(),
            },
            PolicyKind::Distributed => {
                EvictionPolicy::Distributed(DistributedOptions::from_settings(settings))
            }
        }
    }

    /// Configuration tag of this policy
    pub fn kind(&self) -> PolicyKind {
        match self {
            EvictionPolicy::NoOp => PolicyKind::NoOp,
            EvictionPolicy::Local { .. } => PolicyKind::Local,
            EvictionPolicy::Distributed(_) => PolicyKind::Distributed,
        }
    }

    /// Build the store for this policy
    ///
    /// # Errors
    ///
    /// `Config` if the distributed policy is chosen without a backend;
    /// `BackendUnavailable` if the backend rejects its configuration.
    pub fn build(
        &self,
        backend: Option<Arc<dyn KvBackend>>,
        clock: Arc<dyn Clock>,
    ) -> SemcacheResult<Arc<dyn LivenessStore>> {
        match self {
            EvictionPolicy::NoOp => Ok(Arc::new(NoOpStore::new())),
            EvictionPolicy::Local { capacity, ttl } => {
                Ok(Arc::new(LocalStore::with_clock(*capacity, *ttl, clock)))
            }
            EvictionPolicy::Distributed(options) => {
                let backend = backend.ok_or_else(|| {
                    SemcacheError::Config(
                        "distributed eviction needs a key-value backend".to_string(),
                    )
                })?;
                Ok(Arc::new(DistributedStore::new(backend, options.clone())?))
            }
        }
    }
}
