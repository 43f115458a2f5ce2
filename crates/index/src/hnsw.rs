//! HNSW (Hierarchical Navigable Small World) graph
//!
//! O(log n) approximate nearest neighbor search built from scratch.
//!
//! ## Design Goals
//! - Incremental inserts
//! - No deletes: rows leave the graph only through a full rebuild
//! - Deterministic results (fixed RNG seed, sorted neighbor lists)
//!
//! ## Algorithm
//!
//! HNSW builds a multi-layer graph where:
//! - Layer 0 contains all nodes with up to 2*M connections each
//! - Higher layers contain a subset of nodes with up to M connections each
//! - Search starts from the top layer and greedily descends to layer 0
//! - At each layer, a beam search finds the ef closest neighbors
//!
//! ## Determinism
//!
//! - Fixed RNG seed + monotonic counter for level assignment
//! - BTreeSet for neighbor lists (sorted)
//! - Tie-breaking: (distance asc, RowId asc)

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap};
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use semcache_core::{DistanceMetric, SemcacheError, SemcacheResult};

use crate::distance::compute_distance;
use crate::heap::{RowHeap, RowId};

/// HNSW configuration parameters
#[derive(Debug, Clone, PartialEq)]
pub struct HnswParams {
    /// Max connections per layer (default: 32)
    pub m: usize,
    /// Build-time beam width (default: 200)
    pub ef_construction: usize,
    /// Search-time beam width (default: 64)
    pub ef_search: usize,
    /// Level multiplier: 1/ln(m)
    pub ml: f64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self::new(32, 200, 64)
    }
}

impl HnswParams {
    /// Build params, deriving the level multiplier from `m`
    pub fn new(m: usize, ef_construction: usize, ef_search: usize) -> Self {
        let m = m.max(2);
        Self {
            m,
            ef_construction: ef_construction.max(1),
            ef_search: ef_search.max(1),
            ml: 1.0 / (m as f64).ln(),
        }
    }

    /// Max connections for layer 0 (2*M)
    fn max_connections_layer0(&self) -> usize {
        self.m * 2
    }

    /// Max connections for layers > 0
    fn max_connections(&self) -> usize {
        self.m
    }
}

/// A node in the HNSW graph
#[derive(Debug, Clone)]
struct HnswNode {
    /// neighbors[layer] = sorted set of neighbor rows
    neighbors: Vec<BTreeSet<RowId>>,
}

impl HnswNode {
    fn new(max_layer: usize) -> Self {
        Self {
            neighbors: (0..=max_layer).map(|_| BTreeSet::new()).collect(),
        }
    }

    fn max_layer(&self) -> usize {
        self.neighbors.len().saturating_sub(1)
    }
}

/// Scored candidate; orders by (distance asc, row asc)
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    distance: f32,
    row: RowId,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap<Candidate> = max-heap (farthest on top, evicted first)
        // BinaryHeap<Reverse<Candidate>> = min-heap (nearest popped first)
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.row.cmp(&other.row))
    }
}

/// Graph-only HNSW structure. Does NOT own embeddings.
///
/// Every method that needs distances takes the `RowHeap` holding the rows.
/// Node `i` of the graph is row `i` of the heap.
pub(crate) struct HnswGraph {
    params: HnswParams,
    metric: DistanceMetric,
    nodes: Vec<HnswNode>,
    entry_point: Option<RowId>,
    max_level: usize,
    rng_seed: u64,
    rng_counter: u64,
}

impl HnswGraph {
    /// Create a new empty graph
    pub(crate) fn new(metric: DistanceMetric, params: HnswParams, capacity_hint: usize) -> Self {
        Self {
            params,
            metric,
            nodes: Vec::with_capacity(capacity_hint),
            entry_point: None,
            max_level: 0,
            rng_seed: 42,
            rng_counter: 0,
        }
    }

    pub(crate) fn params(&self) -> &HnswParams {
        &self.params
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    // ========================================================================
    // Level Assignment
    // ========================================================================

    /// Assign a random level for a new node using deterministic RNG
    ///
    /// Identical insert sequences produce identical graphs.
    fn assign_level(&mut self) -> usize {
        self.rng_counter += 1;
        let hash = splitmix64(self.rng_seed.wrapping_add(self.rng_counter));

        // Convert to uniform (0, 1) and apply exponential distribution
        let uniform = ((hash as f64) / (u64::MAX as f64)).max(1e-15);
        (-uniform.ln() * self.params.ml) as usize
    }

    // ========================================================================
    // Graph Operations
    // ========================================================================

    fn neighbors_at(&self, row: RowId, layer: usize) -> impl Iterator<Item = RowId> + '_ {
        self.nodes
            .get(row.index())
            .and_then(|n| n.neighbors.get(layer))
            .into_iter()
            .flatten()
            .copied()
    }

    /// Beam search at a single layer (Paper Algorithm 2: SEARCH-LAYER)
    ///
    /// Returns up to `ef` closest nodes sorted by (distance asc, row asc).
    fn search_layer(
        &self,
        query: &[f32],
        entry: RowId,
        ef: usize,
        layer: usize,
        heap: &RowHeap,
    ) -> Vec<Candidate> {
        let entry_embedding = match heap.get(entry) {
            Some(e) => e,
            None => return Vec::new(),
        };
        let start = Candidate {
            distance: compute_distance(query, entry_embedding, self.metric),
            row: entry,
        };

        let mut visited = vec![false; self.nodes.len()];
        visited[entry.index()] = true;

        // C: candidates, nearest popped first
        let mut candidates = BinaryHeap::new();
        candidates.push(Reverse(start));

        // W: dynamic result list, farthest on top for eviction
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();
        results.push(start);

        while let Some(Reverse(nearest)) = candidates.pop() {
            // Paper line 7: nearest candidate is farther than the worst result
            let worst = results.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);
            if nearest.distance > worst && results.len() >= ef {
                break;
            }

            for neighbor in self.neighbors_at(nearest.row, layer) {
                let seen = match visited.get_mut(neighbor.index()) {
                    Some(seen) => seen,
                    None => continue,
                };
                if *seen {
                    continue;
                }
                *seen = true;

                let neighbor_embedding = match heap.get(neighbor) {
                    Some(e) => e,
                    None => continue,
                };
                let distance = compute_distance(query, neighbor_embedding, self.metric);
                let worst = results.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);

                if results.len() < ef || distance < worst {
                    let candidate = Candidate {
                        distance,
                        row: neighbor,
                    };
                    candidates.push(Reverse(candidate));
                    results.push(candidate);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out = results.into_vec();
        out.sort();
        out
    }

    /// Greedy search from `from_layer` down to `to_layer` (ef = 1)
    ///
    /// At each layer moves to the globally best neighbor until no neighbor
    /// improves on the current node.
    fn greedy_search_to_layer(
        &self,
        query: &[f32],
        entry: RowId,
        from_layer: usize,
        to_layer: usize,
        heap: &RowHeap,
    ) -> RowId {
        let mut current = entry;

        for layer in (to_layer..=from_layer).rev() {
            loop {
                let current_embedding = match heap.get(current) {
                    Some(e) => e,
                    None => break,
                };
                let mut best_distance = compute_distance(query, current_embedding, self.metric);
                let mut best = current;

                for neighbor in self.neighbors_at(current, layer) {
                    if let Some(embedding) = heap.get(neighbor) {
                        let distance = compute_distance(query, embedding, self.metric);
                        if distance < best_distance
                            || (distance == best_distance && neighbor < best)
                        {
                            best_distance = distance;
                            best = neighbor;
                        }
                    }
                }

                if best == current {
                    break;
                }
                current = best;
            }
        }

        current
    }

    /// Prune a node's neighbors at `layer` down to the `max_connections` nearest
    fn prune_neighbors_for(
        &mut self,
        row: RowId,
        layer: usize,
        max_connections: usize,
        heap: &RowHeap,
    ) {
        let embedding = match heap.get(row) {
            Some(e) => e,
            None => return,
        };

        let mut scored: Vec<Candidate> = self
            .neighbors_at(row, layer)
            .filter_map(|n| {
                heap.get(n).map(|n_emb| Candidate {
                    distance: compute_distance(embedding, n_emb, self.metric),
                    row: n,
                })
            })
            .collect();
        scored.sort();

        let keep: BTreeSet<RowId> = scored
            .iter()
            .take(max_connections)
            .map(|c| c.row)
            .collect();

        if let Some(set) = self
            .nodes
            .get_mut(row.index())
            .and_then(|n| n.neighbors.get_mut(layer))
        {
            *set = keep;
        }
    }

    // ========================================================================
    // Insert / Search
    // ========================================================================

    /// Link row `row` (already appended to `heap`) into the graph
    /// (Paper Algorithm 1: INSERT)
    ///
    /// Rows must be inserted in id order: node `i` is row `i`.
    pub(crate) fn insert(&mut self, row: RowId, heap: &RowHeap) {
        debug_assert_eq!(row.index(), self.nodes.len(), "rows must be linked in order");

        let level = self.assign_level();
        self.nodes.push(HnswNode::new(level));

        let entry = match self.entry_point {
            Some(entry) => entry,
            None => {
                self.entry_point = Some(row);
                self.max_level = level;
                return;
            }
        };
        let embedding = match heap.get(row) {
            Some(e) => e,
            None => return,
        };

        // Paper lines 4-6: greedy descent to level+1
        let mut current = entry;
        if self.max_level > level {
            current = self.greedy_search_to_layer(embedding, entry, self.max_level, level + 1, heap);
        }

        // Paper lines 7-16: connect at each layer from min(level, max_level) down
        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates =
                self.search_layer(embedding, current, self.params.ef_construction, layer, heap);

            // Paper line 9: SELECT-NEIGHBORS(q, W, M)
            let selected: Vec<RowId> = candidates
                .iter()
                .filter(|c| c.row != row)
                .take(self.params.m)
                .map(|c| c.row)
                .collect();

            self.nodes[row.index()].neighbors[layer].extend(selected.iter().copied());

            let max_conn = if layer == 0 {
                self.params.max_connections_layer0()
            } else {
                self.params.max_connections()
            };

            // Paper lines 11-15: reverse links, pruned only past Mmax
            for &neighbor in &selected {
                let needs_prune = match self
                    .nodes
                    .get_mut(neighbor.index())
                    .and_then(|n| n.neighbors.get_mut(layer))
                {
                    Some(set) => {
                        set.insert(row);
                        set.len() > max_conn
                    }
                    None => false,
                };
                if needs_prune {
                    self.prune_neighbors_for(neighbor, layer, max_conn, heap);
                }
            }

            if let Some(closest) = candidates.first() {
                current = closest.row;
            }
        }

        if level > self.max_level {
            self.entry_point = Some(row);
            self.max_level = level;
        }
    }

    /// Search for the `k` nearest rows
    ///
    /// Results are sorted by (distance asc, row asc).
    pub(crate) fn search(&self, query: &[f32], k: usize, heap: &RowHeap) -> Vec<(RowId, f32)> {
        if k == 0 || self.nodes.is_empty() || query.len() != heap.dimension() {
            return Vec::new();
        }

        let entry = match self.entry_point {
            Some(entry) => entry,
            None => return Vec::new(),
        };

        let mut current = entry;
        if self.max_level > 0 {
            current = self.greedy_search_to_layer(query, entry, self.max_level, 1, heap);
        }

        let ef = self.params.ef_search.max(k);
        self.search_layer(query, current, ef, 0, heap)
            .into_iter()
            .take(k)
            .map(|c| (c.row, c.distance))
            .collect()
    }

    /// Memory usage of the graph structure (excludes embedding data)
    pub(crate) fn memory_usage(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| {
                node.neighbors
                    .iter()
                    .map(|ns| ns.len() * 16 + 64)
                    .sum::<usize>()
                    + 64
            })
            .sum()
    }

    // ========================================================================
    // Snapshot State
    // ========================================================================

    /// Serialize graph state
    ///
    /// ```text
    /// [has_entry: u8][entry: u64 if has_entry]
    /// [max_level: u64][rng_seed: u64][rng_counter: u64]
    /// [node_count: u64]
    /// per node: [layer_count: u64] per layer: [count: u64][neighbor: u64]*
    /// ```
    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        match self.entry_point {
            Some(row) => {
                w.write_u8(1)?;
                w.write_u64::<LittleEndian>(row.as_u64())?;
            }
            None => w.write_u8(0)?,
        }
        w.write_u64::<LittleEndian>(self.max_level as u64)?;
        w.write_u64::<LittleEndian>(self.rng_seed)?;
        w.write_u64::<LittleEndian>(self.rng_counter)?;
        w.write_u64::<LittleEndian>(self.nodes.len() as u64)?;

        for node in &self.nodes {
            w.write_u64::<LittleEndian>(node.neighbors.len() as u64)?;
            for layer in &node.neighbors {
                w.write_u64::<LittleEndian>(layer.len() as u64)?;
                for &neighbor in layer {
                    w.write_u64::<LittleEndian>(neighbor.as_u64())?;
                }
            }
        }
        Ok(())
    }

    /// Deserialize graph state written by `write_to`
    ///
    /// Rejects truncated data and neighbor ids outside the node range.
    pub(crate) fn read_from<R: Read>(
        r: &mut R,
        metric: DistanceMetric,
        params: HnswParams,
    ) -> SemcacheResult<Self> {
        let truncated = |_| SemcacheError::format("unexpected end of graph data");

        let entry_point = match r.read_u8().map_err(truncated)? {
            0 => None,
            1 => Some(RowId::new(r.read_u64::<LittleEndian>().map_err(truncated)?)),
            other => {
                return Err(SemcacheError::format(format!(
                    "invalid entry point flag {}",
                    other
                )))
            }
        };
        let max_level = r.read_u64::<LittleEndian>().map_err(truncated)? as usize;
        let rng_seed = r.read_u64::<LittleEndian>().map_err(truncated)?;
        let rng_counter = r.read_u64::<LittleEndian>().map_err(truncated)?;
        let node_count = r.read_u64::<LittleEndian>().map_err(truncated)?;

        let mut nodes = Vec::new();
        for _ in 0..node_count {
            let layer_count = r.read_u64::<LittleEndian>().map_err(truncated)?;
            let mut neighbors = Vec::new();
            for _ in 0..layer_count {
                let count = r.read_u64::<LittleEndian>().map_err(truncated)?;
                let mut layer = BTreeSet::new();
                for _ in 0..count {
                    let neighbor = r.read_u64::<LittleEndian>().map_err(truncated)?;
                    if neighbor >= node_count {
                        return Err(SemcacheError::format(format!(
                            "neighbor {} out of range ({} nodes)",
                            neighbor, node_count
                        )));
                    }
                    layer.insert(RowId::new(neighbor));
                }
                neighbors.push(layer);
            }
            if neighbors.is_empty() {
                return Err(SemcacheError::format("graph node without layers"));
            }
            nodes.push(HnswNode { neighbors });
        }

        if let Some(entry) = entry_point {
            match nodes.get(entry.index()) {
                Some(node) if node.max_layer() >= max_level => {}
                _ => return Err(SemcacheError::format("invalid graph entry point")),
            }
        }

        Ok(Self {
            params,
            metric,
            nodes,
            entry_point,
            max_level,
            rng_seed,
            rng_counter,
        })
    }
}

/// SplitMix64 hash function for deterministic PRNG
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(vectors: &[Vec<f32>], params: HnswParams) -> (HnswGraph, RowHeap) {
        let dim = vectors[0].len();
        let mut heap = RowHeap::new(dim, vectors.len());
        let mut graph = HnswGraph::new(DistanceMetric::Euclidean, params, vectors.len());
        for v in vectors {
            let row = heap.push(v).unwrap();
            graph.insert(row, &heap);
        }
        (graph, heap)
    }

    fn grid(n: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| vec![(i % 17) as f32, (i / 17) as f32, ((i * 7) % 5) as f32])
            .collect()
    }

    #[test]
    fn test_search_empty_graph() {
        let heap = RowHeap::new(3, 0);
        let graph = HnswGraph::new(DistanceMetric::Euclidean, HnswParams::default(), 0);
        assert!(graph.search(&[0.0, 0.0, 0.0], 5, &heap).is_empty());
    }

    #[test]
    fn test_single_node_is_found() {
        let (graph, heap) = build(&[vec![1.0, 2.0, 3.0]], HnswParams::default());
        let results = graph.search(&[1.0, 2.0, 3.0], 3, &heap);
        assert_eq!(results, vec![(RowId::new(0), 0.0)]);
    }

    #[test]
    fn test_exact_match_ranks_first() {
        let vectors = grid(300);
        let (graph, heap) = build(&vectors, HnswParams::new(8, 64, 64));
        for probe in [0usize, 17, 150, 299] {
            let results = graph.search(&vectors[probe], 1, &heap);
            assert_eq!(results[0].1, 0.0, "probe {} must find itself", probe);
        }
    }

    #[test]
    fn test_results_sorted_and_tie_broken_by_row() {
        // Rows 0 and 1 are equidistant from the query
        let vectors = vec![vec![1.0, 0.0], vec![-1.0, 0.0], vec![5.0, 5.0]];
        let (graph, heap) = build(&vectors, HnswParams::default());
        let results = graph.search(&[0.0, 0.0], 3, &heap);
        assert_eq!(results[0].0, RowId::new(0));
        assert_eq!(results[1].0, RowId::new(1));
        assert_eq!(results[2].0, RowId::new(2));
        assert!(results.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_recall_against_brute_force() {
        let vectors = grid(500);
        let (graph, heap) = build(&vectors, HnswParams::default());
        let query = vec![8.3, 12.1, 2.2];

        let mut exact: Vec<(usize, f32)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, compute_distance(&query, v, DistanceMetric::Euclidean)))
            .collect();
        exact.sort_by(|a, b| a.1.total_cmp(&b.1));

        let found = graph.search(&query, 10, &heap);
        let hits = found
            .iter()
            .filter(|(row, _)| exact[..10].iter().any(|(i, _)| *i as u64 == row.as_u64()))
            .count();
        assert!(hits >= 9, "recall@10 too low: {}", hits);
    }

    #[test]
    fn test_neighbor_lists_respect_max_connections() {
        let params = HnswParams::new(4, 32, 16);
        let (graph, _heap) = build(&grid(200), params.clone());
        for node in &graph.nodes {
            for (layer, set) in node.neighbors.iter().enumerate() {
                let max = if layer == 0 { params.m * 2 } else { params.m };
                assert!(set.len() <= max);
            }
        }
    }

    #[test]
    fn test_deterministic_construction() {
        let vectors = grid(120);
        let (a, _) = build(&vectors, HnswParams::default());
        let (b, _) = build(&vectors, HnswParams::default());

        let mut bytes_a = Vec::new();
        let mut bytes_b = Vec::new();
        a.write_to(&mut bytes_a).unwrap();
        b.write_to(&mut bytes_b).unwrap();
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn test_graph_state_round_trip() {
        let vectors = grid(80);
        let (graph, heap) = build(&vectors, HnswParams::default());
        let mut bytes = Vec::new();
        graph.write_to(&mut bytes).unwrap();

        let restored =
            HnswGraph::read_from(&mut bytes.as_slice(), DistanceMetric::Euclidean, HnswParams::default())
                .unwrap();
        let query = vec![3.5, 2.0, 1.0];
        assert_eq!(graph.search(&query, 5, &heap), restored.search(&query, 5, &heap));
    }

    #[test]
    fn test_truncated_graph_state_is_rejected() {
        let (graph, _) = build(&grid(10), HnswParams::default());
        let mut bytes = Vec::new();
        graph.write_to(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 3);

        let result =
            HnswGraph::read_from(&mut bytes.as_slice(), DistanceMetric::Euclidean, HnswParams::default());
        assert!(matches!(result, Err(SemcacheError::FormatMismatch(_))));
    }
}
