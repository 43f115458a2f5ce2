//! KeyedIndex: an engine plus its row ↔ CacheKey tables
//!
//! Row ids only mean something inside one engine instance, so the key map
//! travels with the engine and is rebuilt with it. Re-inserting an existing
//! key appends a new row and repoints the key; the old row is "superseded"
//! and filtered out of search results until the next rebuild compacts it.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use semcache_core::{CacheKey, SemcacheError, SemcacheResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{IndexConfig, VectorIndexEngine};
use crate::heap::RowId;
use crate::snapshot::write_atomic;

const KEY_TABLE_VERSION: u32 = 1;

/// One search hit resolved to its cache key
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedHit {
    /// Cache key owning the row
    pub key: CacheKey,
    /// Row inside the instance that answered the query
    pub row: RowId,
    /// Distance to the query (lower = nearer)
    pub distance: f32,
}

#[derive(Serialize, Deserialize)]
struct KeyTable {
    version: u32,
    keys: Vec<CacheKey>,
}

/// Engine with key bookkeeping
pub struct KeyedIndex {
    engine: VectorIndexEngine,
    /// row_keys[row] = key that inserted the row
    row_keys: Vec<CacheKey>,
    /// key -> its current row
    key_rows: HashMap<CacheKey, RowId>,
}

impl KeyedIndex {
    /// Empty index with `config`
    pub fn new(config: IndexConfig) -> SemcacheResult<Self> {
        Ok(Self::from_engine(VectorIndexEngine::with_config(config)?))
    }

    /// Wrap an empty engine
    fn from_engine(engine: VectorIndexEngine) -> Self {
        Self {
            engine,
            row_keys: Vec::new(),
            key_rows: HashMap::new(),
        }
    }

    /// Empty index with this index's configuration
    pub fn empty_like(&self) -> Self {
        Self::from_engine(self.engine.empty_like())
    }

    /// Underlying engine (read-only)
    pub fn engine(&self) -> &VectorIndexEngine {
        &self.engine
    }

    /// Embedding dimension
    pub fn dimension(&self) -> usize {
        self.engine.dimension()
    }

    /// Total rows, superseded ones included
    pub fn rows(&self) -> usize {
        self.row_keys.len()
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.key_rows.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.key_rows.is_empty()
    }

    /// Rows whose key has since been re-inserted
    pub fn superseded(&self) -> usize {
        self.row_keys.len() - self.key_rows.len()
    }

    /// Whether `key` has a row
    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.key_rows.contains_key(key)
    }

    /// Current row of `key`
    pub fn row_of(&self, key: &CacheKey) -> Option<RowId> {
        self.key_rows.get(key).copied()
    }

    /// Key that inserted `row`
    pub fn key_of(&self, row: RowId) -> Option<&CacheKey> {
        self.row_keys.get(row.as_u64() as usize)
    }

    /// Stored vector of `key`
    pub fn vector_of(&self, key: &CacheKey) -> SemcacheResult<Vec<f32>> {
        let row = self.row_of(key).ok_or_else(|| SemcacheError::KeyNotFound {
            key: key.to_string(),
        })?;
        self.engine.reconstruct(row)
    }

    /// Iterate distinct keys (arbitrary order)
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.key_rows.keys()
    }

    fn is_current(&self, row: RowId) -> bool {
        self.key_of(row)
            .and_then(|key| self.key_rows.get(key))
            .map_or(false, |current| *current == row)
    }

    /// Append `vector` under `key`
    pub fn insert(&mut self, key: CacheKey, vector: &[f32]) -> SemcacheResult<RowId> {
        let row = self.engine.add(vector)?;
        self.row_keys.push(key.clone());
        self.key_rows.insert(key, row);
        Ok(row)
    }

    /// Append many `(key, vector)` pairs; all-or-nothing on dimension errors
    pub fn insert_batch<V: AsRef<[f32]>>(
        &mut self,
        entries: &[(CacheKey, V)],
    ) -> SemcacheResult<Vec<RowId>> {
        let vectors: Vec<&[f32]> = entries.iter().map(|(_, v)| v.as_ref()).collect();
        let rows = self.engine.add_batch(&vectors)?;
        for ((key, _), row) in entries.iter().zip(&rows) {
            self.row_keys.push(key.clone());
            self.key_rows.insert(key.clone(), *row);
        }
        Ok(rows)
    }

    /// Up to `k` nearest keys, superseded rows skipped
    pub fn search(&self, query: &[f32], k: usize) -> SemcacheResult<Vec<KeyedHit>> {
        if k == 0 {
            self.engine.check_dimension(query)?;
            return Ok(Vec::new());
        }
        let fetch = k.saturating_add(self.superseded());
        let hits = self
            .engine
            .search(query, fetch)?
            .into_iter()
            .filter(|(row, _)| self.is_current(*row))
            .take(k)
            .filter_map(|(row, distance)| {
                self.key_of(row).map(|key| KeyedHit {
                    key: key.clone(),
                    row,
                    distance,
                })
            })
            .collect();
        Ok(hits)
    }

    /// Sidecar path holding the key table for the snapshot at `path`
    pub fn key_table_path(path: &Path) -> PathBuf {
        let mut name = OsString::from(path.as_os_str());
        name.push(".keys");
        PathBuf::from(name)
    }

    /// Persist the engine snapshot at `path` and the key table beside it
    pub fn persist(&self, path: &Path) -> SemcacheResult<()> {
        let table = KeyTable {
            version: KEY_TABLE_VERSION,
            keys: self.row_keys.clone(),
        };
        let bytes =
            rmp_serde::to_vec(&table).map_err(|e| SemcacheError::Serialization(e.to_string()))?;
        self.engine.persist(path)?;
        write_atomic(&Self::key_table_path(path), &bytes)?;
        debug!(keys = self.len(), rows = self.rows(), "key table persisted");
        Ok(())
    }

    /// Load an index written by `persist`
    ///
    /// # Errors
    ///
    /// `FormatMismatch` if the key table is unreadable or its length differs
    /// from the engine's row count.
    pub fn load(path: &Path, dimension: usize) -> SemcacheResult<Self> {
        let engine = VectorIndexEngine::load(path, dimension)?;
        let bytes = std::fs::read(Self::key_table_path(path))?;
        let table: KeyTable = rmp_serde::from_slice(&bytes)
            .map_err(|e| SemcacheError::format(format!("bad key table: {}", e)))?;
        if table.version != KEY_TABLE_VERSION {
            return Err(SemcacheError::format(format!(
                "unsupported key table version {}",
                table.version
            )));
        }
        if table.keys.len() != engine.size() {
            return Err(SemcacheError::format(format!(
                "key table has {} entries, index has {} rows",
                table.keys.len(),
                engine.size()
            )));
        }

        let mut key_rows = HashMap::with_capacity(table.keys.len());
        for (i, key) in table.keys.iter().enumerate() {
            key_rows.insert(key.clone(), RowId::new(i as u64));
        }
        Ok(Self {
            engine,
            row_keys: table.keys,
            key_rows,
        })
    }
}
