//! HNSW (Hierarchical Navigable Small World) graph over integer labels.
//!
//! Wraps `hnsw_rs` with:
//! - distance-space dispatch (inner product, cosine, L2)
//! - label-based incremental insert with capacity accounting
//! - soft-delete via a tombstone set excluded through filtered search
//! - checksummed serialization into a generation directory
//!
//! ## Memory Management
//!
//! When deserializing, hnsw_rs returns `Hnsw<'a>` borrowing from `HnswIo`.
//! `LoadedGraph` manages this self-referential pattern: `HnswIo` is
//! heap-allocated behind a raw pointer, the `Hnsw` lifetime is transmuted
//! to `'static` (sound because `HnswIo` outlives it), and a custom `Drop`
//! frees them in order. A loaded graph is read-only; the vector layer
//! rebuilds an owned graph from the sidecar before the first write after a
//! cold start.
//!
//! ## CRITICAL: hnsw_rs version dependency
//!
//! The transmute in `persist.rs` is sound only while `HnswIo::load_hnsw()`
//! keeps returning a `Hnsw` that merely reads data owned by the `HnswIo`.
//! If upgrading hnsw_rs, re-verify that contract. Current tested version:
//! hnsw_rs 0.3.x.

mod persist;

use std::collections::HashSet;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicUsize, Ordering};

use hnsw_rs::hnswio::HnswIo;
use hnsw_rs::prelude::*;
use thiserror::Error;

use crate::config::{Space, VectorConfig};
use crate::embedder::l2_norm;

/// Maximum layers in the graph.
pub(crate) const MAX_LAYER: usize = 16;

/// Occupancy fraction at which the graph should grow.
const GROWTH_THRESHOLD: f64 = 0.8;

#[derive(Error, Debug)]
pub enum HnswError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HNSW index not found at {0}")]
    NotFound(String),
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Zero vector rejected for {0} space")]
    ZeroVector(Space),
    #[error("Capacity exceeded: graph holds {count} of {capacity} points and could not grow")]
    CapacityExceeded { count: usize, capacity: usize },
    #[error("Index was loaded from disk and is read-only; rebuild required before writes")]
    ReadOnly,
    #[error("Index metadata mismatch for {field}: persisted {persisted}, configured {configured}")]
    MetadataMismatch {
        field: &'static str,
        persisted: String,
        configured: String,
    },
    #[error(
        "Checksum mismatch for {file}: expected {expected}, got {actual}. Index may be corrupted."
    )]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("HNSW error: {0}")]
    Internal(String),
}

/// Self-referential wrapper for a graph deserialized from disk.
///
/// `HnswIo` owns the data, `Hnsw` borrows from it. Drop order is enforced
/// manually: `Hnsw` first, then the `HnswIo` allocation.
pub(crate) struct LoadedGraph<D: Distance<f32> + Send + Sync> {
    /// Raw pointer to HnswIo - this struct owns the allocation.
    io_ptr: *mut HnswIo,
    /// Hnsw borrowing from io_ptr (transmuted to 'static, manually dropped).
    hnsw: ManuallyDrop<Hnsw<'static, f32, D>>,
}

impl<D: Distance<f32> + Send + Sync> Drop for LoadedGraph<D> {
    fn drop(&mut self) {
        // SAFETY: drop order is what makes the transmute sound.
        // 1. Drop Hnsw while HnswIo data is still valid
        // 2. Then free HnswIo
        unsafe {
            ManuallyDrop::drop(&mut self.hnsw);
            drop(Box::from_raw(self.io_ptr));
        }
    }
}

// SAFETY: io_ptr points at an HnswIo holding only paths and data buffers;
// the Hnsw structures are internally synchronized; all mutation of this
// wrapper goes through the exclusive owner (the vector layer's lock).
unsafe impl<D: Distance<f32> + Send + Sync> Send for LoadedGraph<D> {}
unsafe impl<D: Distance<f32> + Send + Sync> Sync for LoadedGraph<D> {}

/// Owned-or-loaded graph state for one distance type.
pub(crate) enum GraphState<D: Distance<f32> + Send + Sync> {
    /// Built in memory - owns its data with 'static lifetime.
    Owned(Hnsw<'static, f32, D>),
    /// Deserialized from disk - read-only, self-referential.
    Loaded(LoadedGraph<D>),
}

impl<D: Distance<f32> + Send + Sync> GraphState<D> {
    pub(crate) fn hnsw(&self) -> &Hnsw<'static, f32, D> {
        match self {
            GraphState::Owned(hnsw) => hnsw,
            GraphState::Loaded(loaded) => &loaded.hnsw,
        }
    }
}

/// Graph variant per distance space.
///
/// hnsw_rs is generic over the distance type, so runtime space selection
/// becomes enum dispatch. The `with_graph!` macro monomorphizes each
/// operation per arm.
pub(crate) enum SpaceGraph {
    InnerProduct(GraphState<DistDot>),
    Cosine(GraphState<DistCosine>),
    L2(GraphState<DistL2>),
}

macro_rules! with_graph {
    ($graph:expr, $g:ident => $body:expr) => {
        match $graph {
            SpaceGraph::InnerProduct(state) => {
                let $g = state.hnsw();
                $body
            }
            SpaceGraph::Cosine(state) => {
                let $g = state.hnsw();
                $body
            }
            SpaceGraph::L2(state) => {
                let $g = state.hnsw();
                $body
            }
        }
    };
}

pub(crate) use with_graph;

fn new_graph<D: Distance<f32> + Default + Send + Sync>(
    m: usize,
    capacity: usize,
    ef_construction: usize,
) -> Hnsw<'static, f32, D> {
    Hnsw::new(m, capacity.max(1), MAX_LAYER, ef_construction, D::default())
}

/// ANN index over `u64` labels.
///
/// Labels are assigned by the vector layer and never reused within a
/// generation; a rebuild renumbers them densely. The graph retains
/// tombstoned points until a rebuild reclaims them.
pub struct HnswIndex {
    pub(crate) graph: SpaceGraph,
    dim: usize,
    space: Space,
    m: usize,
    ef_construction: usize,
    ef_search: AtomicUsize,
    capacity: usize,
    /// Points inserted into the graph, including tombstoned ones.
    count: usize,
    /// Soft-deleted labels, excluded from search via filtered knn.
    deleted: HashSet<usize>,
}

impl HnswIndex {
    /// Create an empty owned graph with the configured initial capacity.
    pub fn new(config: &VectorConfig) -> Self {
        Self::with_capacity(config, config.max_elements)
    }

    /// Create an empty owned graph with an explicit capacity (used when
    /// growing by doubling).
    pub fn with_capacity(config: &VectorConfig, capacity: usize) -> Self {
        let graph = match config.space {
            Space::InnerProduct => SpaceGraph::InnerProduct(GraphState::Owned(new_graph(
                config.m,
                capacity,
                config.ef_construction,
            ))),
            Space::Cosine => SpaceGraph::Cosine(GraphState::Owned(new_graph(
                config.m,
                capacity,
                config.ef_construction,
            ))),
            Space::L2 => SpaceGraph::L2(GraphState::Owned(new_graph(
                config.m,
                capacity,
                config.ef_construction,
            ))),
        };
        Self {
            graph,
            dim: config.dimensions,
            space: config.space,
            m: config.m,
            ef_construction: config.ef_construction,
            ef_search: AtomicUsize::new(config.ef_search),
            capacity,
            count: 0,
            deleted: HashSet::new(),
        }
    }

    /// Insert a point under `label`.
    ///
    /// Fails on dimension mismatch, zero vectors in inner-product/cosine
    /// space, read-only (loaded) graphs, and full graphs. Callers should
    /// consult [`needs_growth`](Self::needs_growth) first and grow by
    /// doubling before the graph fills.
    pub fn add(&mut self, vector: &[f32], label: u64) -> Result<(), HnswError> {
        if vector.len() != self.dim {
            return Err(HnswError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        if self.space.normalizes() && l2_norm(vector) == 0.0 {
            return Err(HnswError::ZeroVector(self.space));
        }
        if !self.is_writable() {
            return Err(HnswError::ReadOnly);
        }
        if self.count >= self.capacity {
            return Err(HnswError::CapacityExceeded {
                count: self.count,
                capacity: self.capacity,
            });
        }

        with_graph!(&self.graph, g => g.insert((vector, label as usize)));
        self.count += 1;
        tracing::trace!(label = label, count = self.count, "HNSW point inserted");
        Ok(())
    }

    /// Tombstone a label. The point stays in the graph but is excluded from
    /// every subsequent search; a rebuild reclaims the space. Idempotent,
    /// and a no-op for labels never inserted.
    pub fn mark_deleted(&mut self, label: u64) {
        self.deleted.insert(label as usize);
    }

    /// k-nearest-neighbor search.
    ///
    /// Over-fetches `min(2k, count)` so the caller can drop tombstones and
    /// still return k live hits when they exist. Results are
    /// `(label, distance)` ordered by distance ascending.
    pub fn knn(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>, HnswError> {
        if query.len() != self.dim {
            return Err(HnswError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        if self.space.normalizes() && l2_norm(query) == 0.0 {
            return Err(HnswError::ZeroVector(self.space));
        }
        let live = self.count;
        if live == 0 || k == 0 {
            return Ok(Vec::new());
        }

        let k_effective = (2 * k).min(live).max(1);
        let ef = self.ef_search.load(Ordering::Relaxed).max(k_effective);

        let deleted = &self.deleted;
        let filter = |id: &usize| -> bool { !deleted.contains(id) };
        let neighbours = with_graph!(&self.graph, g => {
            if deleted.is_empty() {
                g.search(query, k_effective, ef)
            } else {
                g.search_filter(query, k_effective, ef, Some(&filter))
            }
        });

        Ok(neighbours
            .into_iter()
            .map(|n| (n.d_id as u64, n.distance))
            .collect())
    }

    /// Adjust the query-time search breadth.
    pub fn set_ef(&self, ef: usize) {
        self.ef_search.store(ef.max(1), Ordering::Relaxed);
    }

    /// Whether the next insert should trigger growth (80% occupancy).
    pub fn needs_growth(&self) -> bool {
        (self.count + 1) as f64 >= GROWTH_THRESHOLD * self.capacity as f64
    }

    /// Whether this graph accepts inserts (owned, not deserialized).
    pub fn is_writable(&self) -> bool {
        !matches!(
            &self.graph,
            SpaceGraph::InnerProduct(GraphState::Loaded(_))
                | SpaceGraph::Cosine(GraphState::Loaded(_))
                | SpaceGraph::L2(GraphState::Loaded(_))
        )
    }

    /// Points in the graph, including tombstones.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Tombstoned labels.
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn dimensions(&self) -> usize {
        self.dim
    }

    pub fn space(&self) -> Space {
        self.space
    }

    /// Convert a raw graph distance into a similarity score in `[0, 1]`,
    /// monotonically non-increasing in distance:
    /// inner product `(2 − d) / 2`, cosine `1 − d/2`, L2 `1 / (1 + d)`.
    pub fn distance_to_score(space: Space, distance: f32) -> f32 {
        let score = match space {
            Space::InnerProduct => (2.0 - distance) / 2.0,
            Space::Cosine => 1.0 - distance / 2.0,
            Space::L2 => 1.0 / (1.0 + distance.max(0.0)),
        };
        score.clamp(0.0, 1.0)
    }

    pub(crate) fn deleted_labels(&self) -> Vec<u64> {
        let mut labels: Vec<u64> = self.deleted.iter().map(|&l| l as u64).collect();
        labels.sort_unstable();
        labels
    }

    pub(crate) fn restore_deleted(&mut self, labels: &[u64]) {
        self.deleted.extend(labels.iter().map(|&l| l as usize));
    }
}

#[cfg(test)]
pub(crate) fn make_test_vector(seed: u64, dim: usize) -> Vec<f32> {
    // Deterministic but varied; close seeds produce similar vectors.
    let mut v: Vec<f32> = (0..dim)
        .map(|i| (seed as f32 * 0.1 + i as f32 * 0.01).sin())
        .collect();
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dim: usize, space: Space) -> VectorConfig {
        let mut cfg = VectorConfig::new(dim, space);
        cfg.m = 16;
        cfg.ef_construction = 100;
        cfg.ef_search = 50;
        cfg.max_elements = 100;
        cfg
    }

    #[test]
    fn test_new_index_is_empty() {
        let index = HnswIndex::new(&test_config(8, Space::Cosine));
        assert!(index.is_empty());
        assert_eq!(index.count(), 0);
        assert!(index.is_writable());
    }

    #[test]
    fn test_add_and_knn() {
        let mut index = HnswIndex::new(&test_config(8, Space::Cosine));
        for i in 0..10u64 {
            index.add(&make_test_vector(i, 8), i).unwrap();
        }
        assert_eq!(index.count(), 10);

        let results = index.knn(&make_test_vector(5, 8), 3).unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].0, 5);
        for w in results.windows(2) {
            assert!(w[0].1 <= w[1].1, "results not sorted by distance");
        }
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut index = HnswIndex::new(&test_config(8, Space::Cosine));
        let result = index.add(&[1.0, 2.0], 0);
        assert!(matches!(
            result,
            Err(HnswError::DimensionMismatch {
                expected: 8,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_zero_vector_rejected_for_ip_and_cosine() {
        for space in [Space::InnerProduct, Space::Cosine] {
            let mut index = HnswIndex::new(&test_config(4, space));
            assert!(matches!(
                index.add(&[0.0; 4], 0),
                Err(HnswError::ZeroVector(_))
            ));
        }
        // L2 accepts zero vectors
        let mut index = HnswIndex::new(&test_config(4, Space::L2));
        index.add(&[0.0; 4], 0).unwrap();
    }

    #[test]
    fn test_mark_deleted_excludes_from_search() {
        let mut index = HnswIndex::new(&test_config(8, Space::Cosine));
        for i in 0..5u64 {
            index.add(&make_test_vector(i, 8), i).unwrap();
        }
        index.mark_deleted(0);

        let results = index.knn(&make_test_vector(0, 8), 10).unwrap();
        assert!(!results.iter().any(|(label, _)| *label == 0));
        assert_eq!(index.deleted_count(), 1);
    }

    #[test]
    fn test_knn_overfetch_is_capped_by_count() {
        let mut index = HnswIndex::new(&test_config(4, Space::Cosine));
        index.add(&make_test_vector(1, 4), 0).unwrap();
        let results = index.knn(&make_test_vector(1, 4), 100).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_knn_empty_index() {
        let index = HnswIndex::new(&test_config(4, Space::Cosine));
        assert!(index.knn(&make_test_vector(1, 4), 5).unwrap().is_empty());
    }

    #[test]
    fn test_needs_growth_at_threshold() {
        let mut cfg = test_config(4, Space::L2);
        cfg.max_elements = 10;
        let mut index = HnswIndex::new(&cfg);
        for i in 0..7u64 {
            index.add(&make_test_vector(i, 4), i).unwrap();
        }
        assert!(index.needs_growth(), "8th insert reaches 80% of 10");
    }

    #[test]
    fn test_capacity_exceeded_when_full() {
        let mut cfg = test_config(4, Space::L2);
        cfg.max_elements = 2;
        let mut index = HnswIndex::new(&cfg);
        index.add(&make_test_vector(0, 4), 0).unwrap();
        index.add(&make_test_vector(1, 4), 1).unwrap();
        assert!(matches!(
            index.add(&make_test_vector(2, 4), 2),
            Err(HnswError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_distance_to_score_mapping() {
        // Inner product: identical unit vectors give d = 0 → score 1
        assert!((HnswIndex::distance_to_score(Space::InnerProduct, 0.0) - 1.0).abs() < 1e-6);
        // Cosine: opposite vectors give d = 2 → score 0
        assert!(HnswIndex::distance_to_score(Space::Cosine, 2.0).abs() < 1e-6);
        // L2: zero distance → score 1, larger distance → smaller score
        assert!((HnswIndex::distance_to_score(Space::L2, 0.0) - 1.0).abs() < 1e-6);
        assert!(
            HnswIndex::distance_to_score(Space::L2, 1.0)
                > HnswIndex::distance_to_score(Space::L2, 3.0)
        );
    }

    #[test]
    fn test_scores_stay_in_unit_interval() {
        for space in [Space::InnerProduct, Space::Cosine, Space::L2] {
            for d in [0.0f32, 0.5, 1.0, 2.0, 10.0] {
                let s = HnswIndex::distance_to_score(space, d);
                assert!((0.0..=1.0).contains(&s), "{space} d={d} s={s}");
            }
        }
    }

    #[test]
    fn test_set_ef_floor() {
        let index = HnswIndex::new(&test_config(4, Space::Cosine));
        index.set_ef(0);
        // ef is clamped to at least 1; searching still works
        let results = index.knn(&make_test_vector(1, 4), 1).unwrap();
        assert!(results.is_empty());
    }
}
