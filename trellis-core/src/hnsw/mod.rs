//! Two-layer HNSW index: graph storage, search, pruning and the in-memory and
//! on-disk index variants.

mod builder;
mod embeddings;
mod graph;
mod in_mem;
mod layer;
mod mask;
mod offset_map;
mod on_disk;
mod prune;
mod search;
mod visited;

pub use builder::HnswBuilder;
pub use embeddings::{EmbeddingStore, InMemEmbeddings, OnDiskEmbeddings};
pub use graph::InMemHnswGraph;
pub use in_mem::{BuiltLayer, HnswPartitionState, InMemHnswIndex};
pub use layer::{InMemHnswLayer, LayerInfo};
pub use mask::SemanticMask;
pub use offset_map::NodeToGraphOffsetMap;
pub use on_disk::{OnDiskHnswIndex, STORAGE_INFO_BLOB};
pub use prune::select_survivors;
pub use search::{LayerView, SearchParams, SearchType, search_knn, search_nn};
pub use visited::VisitedState;

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Dense row identifier within a node table
pub type NodeOffset = u64;

/// Sentinel for "no node" (empty layer, unused neighbor slot)
pub const INVALID_OFFSET: NodeOffset = u64::MAX;

/// Search result with distance
#[derive(Debug, Clone, Copy)]
pub struct NodeWithDistance {
    pub offset: NodeOffset,
    pub distance: f64,
}

impl NodeWithDistance {
    #[must_use]
    pub const fn new(offset: NodeOffset, distance: f64) -> Self {
        Self { offset, distance }
    }
}

impl PartialEq for NodeWithDistance {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for NodeWithDistance {}

impl PartialOrd for NodeWithDistance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeWithDistance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance).then_with(|| self.offset.cmp(&other.offset))
    }
}

/// Closest node on top
pub type MinNodeQueue = BinaryHeap<Reverse<NodeWithDistance>>;

/// Farthest node on top
pub type MaxNodeQueue = BinaryHeap<NodeWithDistance>;

/// Drains `results` into its `k` closest entries in ascending distance order.
#[must_use]
pub fn pop_top_k(results: MaxNodeQueue, k: usize) -> Vec<NodeWithDistance> {
    let mut top_k = results.into_sorted_vec();
    top_k.truncate(k);
    top_k
}
