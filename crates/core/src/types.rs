//! Core types for semcache
//!
//! This module defines the foundational types:
//! - CacheKey: Opaque string identifying a cached entry (join key between index rows and liveness records)
//! - LivenessState: Answer of a liveness ledger for a single key
//! - Timestamp: Milliseconds since the Unix epoch
//! - DistanceMetric: Distance function fixed per index instance

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque identifier of a cached request
///
/// CacheKeys are stable across index rebuilds. Row ids are not, so every
/// mapping that must survive a rebuild is keyed on CacheKey.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Create a new cache key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the key, returning the inner string
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Liveness of a cache key as reported by a liveness store
///
/// `Unknown` is returned when the store has no record, when the store does
/// no bookkeeping at all (no-op policy), or when a networked backend could
/// not be reached. Callers treat `Unknown` like `Dead`: a key is only served
/// when it is positively known to be alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LivenessState {
    /// Key is live and may be served
    Alive,
    /// Key was evicted and awaits compaction
    Dead,
    /// No record, or the backend could not answer
    Unknown,
}

impl LivenessState {
    /// True only for `Alive`
    pub fn is_alive(self) -> bool {
        matches!(self, LivenessState::Alive)
    }
}

/// Milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The epoch
    pub const ZERO: Timestamp = Timestamp(0);

    /// Create from milliseconds
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// Create from whole seconds
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    /// Milliseconds since the epoch
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Timestamp advanced by `d` (saturating)
    pub fn saturating_add(&self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_millis() as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Distance function of an index
///
/// All variants are expressed as distances: lower = nearer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// L2 distance
    #[default]
    Euclidean,
    /// 1 - cosine similarity
    Cosine,
    /// Negated inner product
    DotProduct,
}

impl DistanceMetric {
    /// Stable byte tag used in snapshot headers
    pub fn to_byte(self) -> u8 {
        match self {
            DistanceMetric::Euclidean => 0,
            DistanceMetric::Cosine => 1,
            DistanceMetric::DotProduct => 2,
        }
    }

    /// Parse a snapshot byte tag
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(DistanceMetric::Euclidean),
            1 => Some(DistanceMetric::Cosine),
            2 => Some(DistanceMetric::DotProduct),
            _ => None,
        }
    }
}
