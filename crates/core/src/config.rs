//! Cache configuration via `semcache.toml`
//!
//! The policy, index shape and rebuild knobs are resolved once at startup
//! from this file. On first open a default `semcache.toml` can be written;
//! to change settings, edit the file and restart.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SemcacheError, SemcacheResult};
use crate::types::DistanceMetric;

/// Config file name placed in the cache data directory.
pub const CONFIG_FILE_NAME: &str = "semcache.toml";

/// Which liveness store / eviction policy to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// An external system owns eviction; no bookkeeping here
    NoOp,
    /// Process-local LRU + TTL
    #[default]
    Local,
    /// Networked key-value backend with native eviction
    Distributed,
}

/// `[index]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexSettings {
    /// Embedding dimension
    pub dimension: usize,
    /// Distance metric (default: euclidean)
    #[serde(default)]
    pub metric: DistanceMetric,
    /// Graph degree (default: 32)
    #[serde(default = "default_m")]
    pub m: usize,
    /// Build-time beam width (default: 200)
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    /// Search-time beam width (default: 64)
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    /// Rows to pre-allocate
    #[serde(default)]
    pub capacity_hint: usize,
    /// Default number of neighbours returned by a search (default: 1)
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Where the index snapshot lives; no persistence when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

fn default_m() -> usize {
    32
}

fn default_ef_construction() -> usize {
    200
}

fn default_ef_search() -> usize {
    64
}

fn default_top_k() -> usize {
    1
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            dimension: 768,
            metric: DistanceMetric::default(),
            m: default_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            capacity_hint: 0,
            top_k: default_top_k(),
            snapshot_path: None,
        }
    }
}

/// `[eviction]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvictionSettings {
    /// `"noop"`, `"local"` or `"distributed"`
    #[serde(default)]
    pub policy: PolicyKind,
    /// Max live keys for the local store (0 = unbounded)
    #[serde(default)]
    pub capacity: usize,
    /// Key lifetime in seconds; no expiry when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    /// Namespace prefix for distributed keys (default: "semcache")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Backend `maxmemory` value, e.g. "100mb"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxmemory: Option<String>,
    /// Backend `maxmemory-policy` value, e.g. "allkeys-lru"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxmemory_policy: Option<String>,
}

fn default_key_prefix() -> String {
    "semcache".to_string()
}

impl Default for EvictionSettings {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            capacity: 0,
            ttl_secs: None,
            key_prefix: default_key_prefix(),
            maxmemory: None,
            maxmemory_policy: None,
        }
    }
}

impl EvictionSettings {
    /// TTL as a `Duration`
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

/// `[rebuild]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RebuildSettings {
    /// Dead-to-total ratio that triggers a rebuild (default: 0.2)
    #[serde(default = "default_dead_ratio")]
    pub dead_ratio_threshold: f64,
    /// Minimum dead rows before a rebuild is considered (default: 1)
    #[serde(default = "default_min_dead")]
    pub min_dead: usize,
    /// Rows inserted between cancellation checks (default: 1024)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Run rebuilds on a background worker (default: true)
    #[serde(default = "default_background")]
    pub background: bool,
}

fn default_dead_ratio() -> f64 {
    0.2
}

fn default_min_dead() -> usize {
    1
}

fn default_chunk_size() -> usize {
    1024
}

fn default_background() -> bool {
    true
}

impl Default for RebuildSettings {
    fn default() -> Self {
        Self {
            dead_ratio_threshold: default_dead_ratio(),
            min_dead: default_min_dead(),
            chunk_size: default_chunk_size(),
            background: default_background(),
        }
    }
}

/// Cache configuration loaded from `semcache.toml`.
///
/// # Example
///
/// ```toml
/// [index]
/// dimension = 768
/// metric = "euclidean"
///
/// [eviction]
/// policy = "local"
/// capacity = 10000
/// ttl_secs = 3600
///
/// [rebuild]
/// dead_ratio_threshold = 0.2
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SemcacheConfig {
    /// Index shape
    #[serde(default)]
    pub index: IndexSettings,
    /// Liveness store / eviction policy
    #[serde(default)]
    pub eviction: EvictionSettings,
    /// Rebuild trigger and execution
    #[serde(default)]
    pub rebuild: RebuildSettings,
}

impl SemcacheConfig {
    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `SemcacheError::Config` naming the first offending field.
    pub fn validate(&self) -> SemcacheResult<()> {
        if self.index.dimension == 0 {
            return Err(SemcacheError::Config(
                "index.dimension must be > 0".to_string(),
            ));
        }
        if self.index.m < 2 {
            return Err(SemcacheError::Config("index.m must be >= 2".to_string()));
        }
        let ratio = self.rebuild.dead_ratio_threshold;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(SemcacheError::Config(format!(
                "rebuild.dead_ratio_threshold must be in (0, 1], got {}",
                ratio
            )));
        }
        if self.rebuild.chunk_size == 0 {
            return Err(SemcacheError::Config(
                "rebuild.chunk_size must be > 0".to_string(),
            ));
        }
        if self.eviction.key_prefix.is_empty() {
            return Err(SemcacheError::Config(
                "eviction.key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# semcache configuration

[index]
# Embedding dimension produced by your embedder
dimension = 768
# Distance metric: "euclidean" (default), "cosine" or "dotproduct"
metric = "euclidean"
# HNSW graph degree and beam widths
m = 32
ef_construction = 200
ef_search = 64
# Neighbours returned by a plain search
top_k = 1
# snapshot_path = "semcache.index"

[eviction]
# "noop" = external store evicts, "local" = in-process LRU/TTL,
# "distributed" = networked key-value backend
policy = "local"
# Max live keys (0 = unbounded)
capacity = 0
# ttl_secs = 3600
key_prefix = "semcache"
# maxmemory = "100mb"
# maxmemory_policy = "allkeys-lru"

[rebuild]
# Rebuild once this share of indexed rows is dead
dead_ratio_threshold = 0.2
min_dead = 1
chunk_size = 1024
background = true
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> SemcacheResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SemcacheError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            SemcacheError::Config(msg) => {
                SemcacheError::Config(format!("{} ({})", msg, path.display()))
            }
            other => other,
        })
    }

    /// Parse and validate config from TOML text.
    pub fn from_toml_str(content: &str) -> SemcacheResult<Self> {
        let config: SemcacheConfig = toml::from_str(content)
            .map_err(|e| SemcacheError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> SemcacheResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                SemcacheError::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> SemcacheResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SemcacheError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
