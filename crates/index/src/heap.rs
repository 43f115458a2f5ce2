//! Row Heap - Contiguous embedding storage
//!
//! RowHeap stores every row of one index instance in a single Vec<f32>.
//! Rows are append-only: row ids are dense, assigned 0, 1, 2, ... in insert
//! order, and never removed. A rebuild produces a new heap and reassigns ids.

use semcache_core::{SemcacheError, SemcacheResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Dense row identifier inside one index instance
///
/// Only meaningful for the lifetime of the instance that assigned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(u64);

impl RowId {
    /// Wrap a raw row number
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw row number
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Row number as a slice index
    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row#{}", self.0)
    }
}

/// Append-only embedding storage
///
/// Layout: [r0_dim0, r0_dim1, ..., r0_dimN, r1_dim0, ...]
/// Each row occupies `dimension` consecutive f32 values, so row `i` starts
/// at offset `i * dimension`.
pub struct RowHeap {
    dimension: usize,
    data: Vec<f32>,
}

impl RowHeap {
    /// Create an empty heap, reserving room for `capacity_hint` rows
    pub fn new(dimension: usize, capacity_hint: usize) -> Self {
        RowHeap {
            dimension,
            data: Vec::with_capacity(dimension.saturating_mul(capacity_hint)),
        }
    }

    /// Create from raw snapshot data
    ///
    /// `data.len()` must be a multiple of `dimension`.
    pub(crate) fn from_raw(dimension: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len() % dimension, 0);
        RowHeap { dimension, data }
    }

    /// Dimension of every row
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reject a vector whose length differs from the heap dimension
    pub fn check_dimension(&self, embedding: &[f32]) -> SemcacheResult<()> {
        if embedding.len() != self.dimension {
            return Err(SemcacheError::dimension(self.dimension, embedding.len()));
        }
        Ok(())
    }

    /// Reserve room for `additional` more rows
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional.saturating_mul(self.dimension));
    }

    /// Append a row, returning its id
    pub fn push(&mut self, embedding: &[f32]) -> SemcacheResult<RowId> {
        self.check_dimension(embedding)?;
        let id = RowId::new(self.len() as u64);
        self.data.extend_from_slice(embedding);
        Ok(id)
    }

    /// Get a row by id
    pub fn get(&self, id: RowId) -> Option<&[f32]> {
        let start = id.index().checked_mul(self.dimension)?;
        let end = start.checked_add(self.dimension)?;
        self.data.get(start..end)
    }

    /// Iterate rows in id order
    pub fn iter(&self) -> impl Iterator<Item = (RowId, &[f32])> {
        self.data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(i, row)| (RowId::new(i as u64), row))
    }

    /// Raw data slice (for snapshot serialization)
    pub fn raw_data(&self) -> &[f32] {
        &self.data
    }

    /// Bytes held by embeddings
    pub fn memory_usage(&self) -> usize {
        self.data.capacity() * std::mem::size_of::<f32>()
    }
}
