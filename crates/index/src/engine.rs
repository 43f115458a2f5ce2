//! VectorIndexEngine: the ANN index of one cache generation
//!
//! Wraps an `HnswGraph` (graph structure) with a `RowHeap` (embedding
//! storage). Rows are appended and searched; there is no deletion. To drop
//! rows, build a new engine from the rows that should survive.
//!
//! Persistence lives in `snapshot.rs`.

use semcache_core::{DistanceMetric, IndexSettings, SemcacheError, SemcacheResult};
use tracing::debug;

use crate::heap::{RowHeap, RowId};
use crate::hnsw::{HnswGraph, HnswParams};

/// Shape of an index instance
///
/// Dimension and metric are immutable for the lifetime of an engine and are
/// carried over unchanged by rebuilds.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    /// Embedding dimension (> 0)
    pub dimension: usize,
    /// Distance metric
    pub metric: DistanceMetric,
    /// Graph parameters
    pub params: HnswParams,
    /// Rows to pre-allocate
    pub capacity_hint: usize,
}

impl IndexConfig {
    /// Euclidean index with default graph parameters
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            metric: DistanceMetric::Euclidean,
            params: HnswParams::default(),
            capacity_hint: 0,
        }
    }

    /// Builder: set metric
    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Builder: set graph parameters
    pub fn with_params(mut self, params: HnswParams) -> Self {
        self.params = params;
        self
    }

    /// Builder: set capacity hint
    pub fn with_capacity_hint(mut self, capacity_hint: usize) -> Self {
        self.capacity_hint = capacity_hint;
        self
    }

    /// Build from the `[index]` section of `semcache.toml`
    pub fn from_settings(settings: &IndexSettings) -> Self {
        Self {
            dimension: settings.dimension,
            metric: settings.metric,
            params: HnswParams::new(settings.m, settings.ef_construction, settings.ef_search),
            capacity_hint: settings.capacity_hint,
        }
    }
}

/// HNSW vector index over a contiguous row heap
pub struct VectorIndexEngine {
    pub(crate) config: IndexConfig,
    pub(crate) heap: RowHeap,
    pub(crate) graph: HnswGraph,
}

impl VectorIndexEngine {
    /// Create an empty Euclidean engine
    ///
    /// # Errors
    ///
    /// `InvalidDimension` if `dimension == 0`.
    pub fn new(dimension: usize, capacity_hint: usize) -> SemcacheResult<Self> {
        Self::with_config(IndexConfig::new(dimension).with_capacity_hint(capacity_hint))
    }

    /// Create an empty engine with an explicit configuration
    pub fn with_config(config: IndexConfig) -> SemcacheResult<Self> {
        if config.dimension == 0 {
            return Err(SemcacheError::InvalidDimension {
                dimension: config.dimension,
            });
        }
        Ok(Self {
            heap: RowHeap::new(config.dimension, config.capacity_hint),
            graph: HnswGraph::new(config.metric, config.params.clone(), config.capacity_hint),
            config,
        })
    }

    /// Assemble from snapshot parts (caller guarantees graph/heap agree)
    pub(crate) fn from_parts(config: IndexConfig, heap: RowHeap, graph: HnswGraph) -> Self {
        Self {
            config,
            heap,
            graph,
        }
    }

    /// A new empty engine with this engine's configuration
    pub fn empty_like(&self) -> Self {
        Self {
            heap: RowHeap::new(self.config.dimension, self.config.capacity_hint),
            graph: HnswGraph::new(
                self.config.metric,
                self.graph.params().clone(),
                self.config.capacity_hint,
            ),
            config: self.config.clone(),
        }
    }

    /// Embedding dimension
    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Distance metric
    pub fn metric(&self) -> DistanceMetric {
        self.config.metric
    }

    /// Engine configuration
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Current row count
    pub fn size(&self) -> usize {
        self.heap.len()
    }

    /// Alias for `size`
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Reject a vector whose length differs from the index dimension
    pub fn check_dimension(&self, vector: &[f32]) -> SemcacheResult<()> {
        self.heap.check_dimension(vector)
    }

    /// Append one vector, returning its row id
    pub fn add(&mut self, vector: &[f32]) -> SemcacheResult<RowId> {
        let row = self.heap.push(vector)?;
        self.graph.insert(row, &self.heap);
        Ok(row)
    }

    /// Append many vectors in one pass
    ///
    /// Every vector is validated before any is inserted, so a dimension
    /// error leaves the engine unchanged. Row ids follow input order.
    pub fn add_batch<V: AsRef<[f32]>>(&mut self, vectors: &[V]) -> SemcacheResult<Vec<RowId>> {
        for v in vectors {
            self.heap.check_dimension(v.as_ref())?;
        }
        self.heap.reserve(vectors.len());

        let mut rows = Vec::with_capacity(vectors.len());
        for v in vectors {
            let row = self.heap.push(v.as_ref())?;
            self.graph.insert(row, &self.heap);
            rows.push(row);
        }
        debug!(rows = rows.len(), total = self.heap.len(), "batch inserted");
        Ok(rows)
    }

    /// Up to `k` nearest rows as `(row, distance)`
    ///
    /// Ordered by ascending distance, ties by smaller row id. An empty index
    /// yields an empty result.
    pub fn search(&self, query: &[f32], k: usize) -> SemcacheResult<Vec<(RowId, f32)>> {
        self.heap.check_dimension(query)?;
        Ok(self.graph.search(query, k, &self.heap))
    }

    /// Up to `k` nearest hits as `(distance, vector)`
    pub fn search_with_vectors(
        &self,
        query: &[f32],
        k: usize,
    ) -> SemcacheResult<Vec<(f32, Vec<f32>)>> {
        self.search(query, k)?
            .into_iter()
            .map(|(row, distance)| Ok((distance, self.reconstruct(row)?)))
            .collect()
    }

    /// The original vector stored at `row`
    ///
    /// # Errors
    ///
    /// `RowNotFound` if the id was never assigned.
    pub fn reconstruct(&self, row: RowId) -> SemcacheResult<Vec<f32>> {
        self.heap
            .get(row)
            .map(|v| v.to_vec())
            .ok_or(SemcacheError::RowNotFound { row: row.as_u64() })
    }

    /// Iterate rows in id order
    pub fn rows(&self) -> impl Iterator<Item = (RowId, &[f32])> {
        self.heap.iter()
    }

    /// Approximate heap + graph footprint in bytes
    pub fn memory_usage(&self) -> usize {
        self.heap.memory_usage() + self.graph.memory_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine4() -> VectorIndexEngine {
        VectorIndexEngine::new(4, 8).unwrap()
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let err = VectorIndexEngine::new(0, 0).err().unwrap();
        assert!(matches!(err, SemcacheError::InvalidDimension { dimension: 0 }));
        assert!(err.is_dimension_error());
    }

    #[test]
    fn test_add_and_reconstruct() {
        let mut engine = engine4();
        let v = vec![0.25, -1.5, 3.0, 1e-7];
        let row = engine.add(&v).unwrap();
        assert_eq!(row, RowId::new(0));
        assert_eq!(engine.reconstruct(row).unwrap(), v);
        assert_eq!(engine.size(), 1);
    }

    #[test]
    fn test_reconstruct_unassigned_row() {
        let mut engine = engine4();
        engine.add(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        let err = engine.reconstruct(RowId::new(1)).unwrap_err();
        assert!(matches!(err, SemcacheError::RowNotFound { row: 1 }));
    }

    #[test]
    fn test_wrong_dimension_rejected_without_mutation() {
        let mut engine = engine4();
        engine.add(&[1.0, 0.0, 0.0, 0.0]).unwrap();

        assert!(engine.add(&[1.0, 0.0]).unwrap_err().is_dimension_error());
        assert!(engine.search(&[1.0; 5], 1).unwrap_err().is_dimension_error());
        assert_eq!(engine.size(), 1);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let mut engine = engine4();
        let batch = vec![vec![1.0; 4], vec![2.0; 3], vec![3.0; 4]];
        assert!(engine.add_batch(&batch).is_err());
        assert!(engine.is_empty());

        let good = vec![vec![1.0; 4], vec![2.0; 4], vec![3.0; 4]];
        let rows = engine.add_batch(&good).unwrap();
        assert_eq!(rows, vec![RowId::new(0), RowId::new(1), RowId::new(2)]);
        assert_eq!(engine.reconstruct(rows[2]).unwrap(), vec![3.0; 4]);
    }

    #[test]
    fn test_search_empty_index_is_empty() {
        let engine = engine4();
        assert!(engine.search(&[0.0; 4], 3).unwrap().is_empty());
    }

    #[test]
    fn test_search_scenario_x_then_y() {
        let mut engine = engine4();
        let x = engine.add(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        let y = engine.add(&[0.0, 1.0, 0.0, 0.0]).unwrap();
        let _z = engine.add(&[0.0, 0.0, 1.0, 0.0]).unwrap();

        let results = engine.search(&[0.9, 0.1, 0.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, x);
        assert_eq!(results[1].0, y);
        assert!(results[0].1 < results[1].1);
    }

    #[test]
    fn test_search_with_vectors() {
        let mut engine = engine4();
        engine.add(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        engine.add(&[0.0, 1.0, 0.0, 0.0]).unwrap();

        let hits = engine.search_with_vectors(&[1.0, 0.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits, vec![(0.0, vec![1.0, 0.0, 0.0, 0.0])]);
    }

    #[test]
    fn test_k_larger_than_size() {
        let mut engine = engine4();
        engine.add(&[1.0; 4]).unwrap();
        engine.add(&[2.0; 4]).unwrap();
        assert_eq!(engine.search(&[0.0; 4], 10).unwrap().len(), 2);
        assert!(engine.search(&[0.0; 4], 0).unwrap().is_empty());
    }

    #[test]
    fn test_empty_like_keeps_shape() {
        let config = IndexConfig::new(3)
            .with_metric(DistanceMetric::Cosine)
            .with_params(HnswParams::new(8, 40, 20));
        let mut engine = VectorIndexEngine::with_config(config.clone()).unwrap();
        engine.add(&[1.0, 0.0, 0.0]).unwrap();

        let fresh = engine.empty_like();
        assert!(fresh.is_empty());
        assert_eq!(fresh.config(), &config);
    }

    #[test]
    fn test_from_settings() {
        let mut settings = IndexSettings::default();
        settings.dimension = 12;
        settings.m = 8;
        let config = IndexConfig::from_settings(&settings);
        assert_eq!(config.dimension, 12);
        assert_eq!(config.params.m, 8);
        assert_eq!(config.metric, DistanceMetric::Euclidean);
    }
}
