//! One in-memory HNSW layer: insertion, search, and degree-bounding shrink.
//!
//! All offsets taken and returned here are graph offsets of this layer.
//! Embeddings are resolved through the layer's [`NodeToGraphOffsetMap`].

use crate::config::{HnswIndexConfig, NODE_GROUP_SIZE};
use crate::distance::DistanceMetric;
use crate::hnsw::search::{LayerView, SearchParams, search_knn, search_nn};
use crate::hnsw::{
    EmbeddingStore, INVALID_OFFSET, InMemEmbeddings, InMemHnswGraph, NodeOffset,
    NodeToGraphOffsetMap, NodeWithDistance, VisitedState, select_survivors,
};
use std::sync::Arc;
use tracing::trace;

/// Construction parameters of one layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerInfo {
    /// Degree bound after shrinking
    pub max_degree: usize,
    /// Row capacity; reaching it triggers an eager shrink
    pub degree_threshold_to_shrink: usize,
    pub efc: usize,
    pub alpha: f64,
    pub metric: DistanceMetric,
}

impl LayerInfo {
    #[must_use]
    pub fn new(config: &HnswIndexConfig, max_degree: usize) -> Self {
        Self {
            max_degree,
            degree_threshold_to_shrink: config.degree_threshold_to_shrink(max_degree),
            efc: config.efc,
            alpha: config.alpha,
            metric: config.metric,
        }
    }
}

/// In-memory layer built concurrently by bulk-build workers.
#[derive(Debug)]
pub struct InMemHnswLayer {
    graph: InMemHnswGraph,
    info: LayerInfo,
    embeddings: Arc<InMemEmbeddings>,
    offset_map: NodeToGraphOffsetMap,
}

impl InMemHnswLayer {
    #[must_use]
    pub fn new(embeddings: Arc<InMemEmbeddings>, offset_map: NodeToGraphOffsetMap, info: LayerInfo) -> Self {
        let graph = InMemHnswGraph::new(offset_map.num_nodes_in_graph(), info.degree_threshold_to_shrink);
        Self { graph, info, embeddings, offset_map }
    }

    #[must_use]
    pub fn info(&self) -> &LayerInfo {
        &self.info
    }

    #[must_use]
    pub fn graph(&self) -> &InMemHnswGraph {
        &self.graph
    }

    #[must_use]
    pub fn offset_map(&self) -> &NodeToGraphOffsetMap {
        &self.offset_map
    }

    #[must_use]
    pub fn entry_point(&self) -> NodeOffset {
        self.graph.entry_point()
    }

    pub(crate) fn into_parts(self) -> (InMemHnswGraph, NodeToGraphOffsetMap, LayerInfo) {
        (self.graph, self.offset_map, self.info)
    }

    /// Links `node` to its `max_degree` nearest nodes, in both directions.
    ///
    /// With an invalid `entry_hint` the node first tries to become the
    /// layer's entry point; if it wins the layer was empty and no edges are
    /// created.
    pub fn insert(&self, node: NodeOffset, entry_hint: NodeOffset, visited: &mut VisitedState) {
        let mut entry = entry_hint;
        if entry == INVALID_OFFSET {
            let current = self.graph.compare_and_swap_entry_point(node);
            if current == INVALID_OFFSET {
                return;
            }
            entry = current;
        }
        let Some(query) = self.embedding(node) else {
            return;
        };
        let closest = self.search_knn(query, entry, self.info.max_degree, self.info.efc, visited);
        for nbr in closest {
            if nbr.offset == node {
                continue;
            }
            self.insert_rel(node, nbr.offset);
            self.insert_rel(nbr.offset, node);
        }
    }

    /// Greedy descent from `entry` towards `query`.
    #[must_use]
    pub fn search_nn(&self, query: &[f32], entry: NodeOffset) -> NodeOffset {
        search_nn(self, self.info.metric, query, entry)
    }

    /// Unfiltered beam search over this layer.
    pub fn search_knn(
        &self,
        query: &[f32],
        entry: NodeOffset,
        k: usize,
        ef: usize,
        visited: &mut VisitedState,
    ) -> Vec<NodeWithDistance> {
        search_knn(self, self.info.metric, query, entry, &SearchParams::unfiltered(k, ef), visited)
    }

    /// Rewrites `node`'s row with its pruned survivors.
    pub fn shrink_for_node(&self, node: NodeOffset) {
        let nbrs: Vec<NodeOffset> = self.graph.neighbors(node).collect();
        let node_offsets: Vec<NodeOffset> = nbrs.iter().map(|&nbr| self.offset_map.graph_to_node(nbr)).collect();
        let candidates: Vec<(NodeOffset, Option<&[f32]>)> =
            nbrs.iter().copied().zip(self.embeddings.embeddings(&node_offsets)).collect();
        let survivors = select_survivors(
            self.embedding(node),
            &candidates,
            self.info.metric,
            self.info.alpha,
            self.info.max_degree,
        );
        for (slot, &survivor) in survivors.iter().enumerate() {
            self.graph.set_neighbor(self.graph.slot_index(node, slot), survivor);
        }
        self.graph.set_length(node, survivors.len());
        trace!(node, before = nbrs.len(), after = survivors.len(), "Shrunk neighbor list");
    }

    /// Shrinks every over-degree node whose row lies in node group
    /// `node_group_idx`. Returns the number of nodes shrunk.
    pub fn finalize(&self, node_group_idx: u64, num_nodes_in_table: u64) -> usize {
        let start = node_group_idx.saturating_mul(NODE_GROUP_SIZE).min(num_nodes_in_table);
        let end = start.saturating_add(NODE_GROUP_SIZE).min(num_nodes_in_table);
        let graph_start = self.offset_map.node_to_graph(start);
        let graph_end = self.offset_map.node_to_graph(end);

        let mut num_shrunk = 0;
        for node in graph_start..graph_end {
            debug_assert!((start..end).contains(&self.offset_map.graph_to_node(node)));
            if self.graph.length(node) > self.info.max_degree {
                self.shrink_for_node(node);
                num_shrunk += 1;
            }
        }
        num_shrunk
    }

    fn insert_rel(&self, src: NodeOffset, dst: NodeOffset) {
        let prev_len = self.graph.increment_length(src);
        let capacity = self.info.degree_threshold_to_shrink;
        if prev_len >= capacity {
            // Lost a race with another insert into a full row
            return;
        }
        self.graph.set_neighbor(self.graph.slot_index(src, prev_len), dst);
        if prev_len == capacity - 1 {
            self.shrink_for_node(src);
        }
    }
}

impl LayerView for InMemHnswLayer {
    fn num_nodes(&self) -> u64 {
        self.graph.num_nodes()
    }

    fn embedding(&self, node: NodeOffset) -> Option<&[f32]> {
        self.embeddings.embedding(self.offset_map.graph_to_node(node))
    }

    fn neighbors(&self, node: NodeOffset, out: &mut Vec<NodeOffset>) {
        out.clear();
        out.extend(self.graph.neighbors(node));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_embeddings(n: usize) -> Arc<InMemEmbeddings> {
        Arc::new(InMemEmbeddings::from_rows(1, (0..n).map(|i| Some(vec![i as f32]))).unwrap())
    }

    fn layer(n: usize, max_degree: usize, efc: usize) -> InMemHnswLayer {
        let config = HnswIndexConfig { metric: DistanceMetric::L2, efc, alpha: 1.0, ..HnswIndexConfig::default() };
        InMemHnswLayer::new(line_embeddings(n), NodeToGraphOffsetMap::trivial(n as u64), LayerInfo::new(&config, max_degree))
    }

    #[test]
    fn test_first_insert_becomes_entry_point() {
        let layer = layer(4, 2, 8);
        let mut visited = VisitedState::new(4);

        layer.insert(2, INVALID_OFFSET, &mut visited);
        assert_eq!(layer.entry_point(), 2);
        assert_eq!(layer.graph().length(2), 0);

        layer.insert(3, INVALID_OFFSET, &mut visited);
        assert_eq!(layer.entry_point(), 2);
        assert_eq!(layer.graph().neighbors(3).collect::<Vec<_>>(), vec![2]);
        assert_eq!(layer.graph().neighbors(2).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_degree_bounded_after_finalize() {
        let n = 64;
        let layer = layer(n, 4, 16);
        let mut visited = VisitedState::new(n as u64);
        for node in 0..n as NodeOffset {
            layer.insert(node, layer.entry_point(), &mut visited);
        }
        layer.finalize(0, n as u64);

        for node in 0..n as NodeOffset {
            let len = layer.graph().neighbors(node).count();
            assert!((1..=4).contains(&len), "node {node} has {len} neighbors");
        }
    }

    #[test]
    fn test_eager_shrink_at_threshold() {
        let layer = layer(8, 2, 8);
        let capacity = layer.info().degree_threshold_to_shrink;
        assert_eq!(capacity, 3);

        for dst in 1..=3 {
            layer.insert_rel(0, dst);
        }
        let len = layer.graph().length(0);
        assert!(len <= 2 && len >= 1);
        assert_eq!(layer.graph().neighbors(0).next(), Some(1));
    }

    #[test]
    fn test_shrink_reads_node_embeddings_through_offset_map() {
        // Graph offsets 0..4 are rows 1, 3, 5, 7 with values 0, 5, 6, 40
        let rows = [100.0, 0.0, 1.0, 5.0, 50.0, 6.0, 2.0, 40.0];
        let embeddings = Arc::new(InMemEmbeddings::from_rows(1, rows.iter().map(|&v| Some(vec![v]))).unwrap());
        let selection = [false, true, false, true, false, true, false, true];
        let config = HnswIndexConfig { metric: DistanceMetric::L2, alpha: 1.0, ..HnswIndexConfig::default() };
        let layer = InMemHnswLayer::new(
            embeddings,
            NodeToGraphOffsetMap::from_selection(&selection),
            LayerInfo::new(&config, 2),
        );

        layer.insert_rel(0, 3);
        layer.insert_rel(0, 2);
        layer.insert_rel(0, 1);

        let survivors: Vec<_> = layer.graph().neighbors(0).collect();
        assert!((1..=2).contains(&survivors.len()));
        assert_eq!(survivors[0], 1);
        assert!(!survivors.contains(&3));
    }

    #[test]
    fn test_search_over_built_layer() {
        let n = 100;
        let layer = layer(n, 6, 32);
        let mut visited = VisitedState::new(n as u64);
        for node in 0..n as NodeOffset {
            layer.insert(node, layer.entry_point(), &mut visited);
        }

        let entry = layer.search_nn(&[42.3], layer.entry_point());
        let results = layer.search_knn(&[42.3], entry, 3, 32, &mut visited);
        let offsets: Vec<_> = results.iter().map(|n| n.offset).collect();
        assert_eq!(offsets, vec![42, 43, 41]);
    }

    #[test]
    fn test_finalize_only_touches_its_group() {
        let config = HnswIndexConfig { metric: DistanceMetric::L2, ..HnswIndexConfig::default() };
        let layer = InMemHnswLayer::new(line_embeddings(12), NodeToGraphOffsetMap::trivial(12), LayerInfo::new(&config, 8));
        // Capacity 10: nine edges overflow the bound without an eager shrink
        for dst in 1..=9 {
            layer.insert_rel(0, dst);
        }
        assert_eq!(layer.graph().length(0), 9);

        assert_eq!(layer.finalize(1, 12), 0);
        assert_eq!(layer.graph().length(0), 9);
        assert_eq!(layer.finalize(0, 12), 1);
        assert!((1..=8).contains(&layer.graph().length(0)));
    }
}
