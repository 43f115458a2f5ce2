//! Core types for semcache
//!
//! This crate defines the foundational types shared by every other crate:
//! - CacheKey: Opaque identifier of a cached request
//! - LivenessState: Alive / Dead / Unknown answer of a liveness ledger
//! - Timestamp + Clock: Millisecond time source, injectable for tests
//! - DistanceMetric: Distance function fixed per index
//! - SemcacheError: Error type hierarchy
//! - SemcacheConfig: `semcache.toml` configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    EvictionSettings, IndexSettings, PolicyKind, RebuildSettings, SemcacheConfig,
    CONFIG_FILE_NAME,
};
pub use error::{SemcacheError, SemcacheResult};
pub use types::{CacheKey, DistanceMetric, LivenessState, Timestamp};
