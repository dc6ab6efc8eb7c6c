//! In-memory two-layer index used for bulk builds.
//!
//! Every non-null row goes into the lower layer. A random subset, each row
//! promoted with probability `pu`, also goes into the upper layer, which
//! supplies entry points into the lower one. Inserts run in parallel on the
//! rayon pool; the built graphs are then handed off as a
//! [`HnswPartitionState`] for persistence.

use crate::config::{HnswIndexConfig, NODE_GROUP_SIZE};
use crate::hnsw::{
    EmbeddingStore, INVALID_OFFSET, InMemEmbeddings, InMemHnswGraph, InMemHnswLayer, LayerInfo,
    NodeOffset, NodeToGraphOffsetMap, NodeWithDistance, VisitedState,
};
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};

/// Bulk-build HNSW index over an in-memory embedding column.
#[derive(Debug)]
pub struct InMemHnswIndex {
    config: HnswIndexConfig,
    embeddings: Arc<InMemEmbeddings>,
    upper_layer: InMemHnswLayer,
    lower_layer: InMemHnswLayer,
}

impl InMemHnswIndex {
    /// Creates an empty index, seeding promotion from `config.seed`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(embeddings: Arc<InMemEmbeddings>, config: HnswIndexConfig) -> Result<Self> {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self::with_rng(embeddings, config, &mut rng)
    }

    /// Creates an empty index, drawing upper-layer promotion from `rng`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn with_rng<R: Rng>(
        embeddings: Arc<InMemEmbeddings>,
        config: HnswIndexConfig,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;
        let num_rows = embeddings.num_rows();
        let promoted: Vec<bool> =
            (0..num_rows).map(|offset| !embeddings.is_null(offset) && rng.random_bool(config.pu)).collect();

        let upper_layer = InMemHnswLayer::new(
            Arc::clone(&embeddings),
            NodeToGraphOffsetMap::from_selection(&promoted),
            LayerInfo::new(&config, config.mu),
        );
        let lower_layer = InMemHnswLayer::new(
            Arc::clone(&embeddings),
            NodeToGraphOffsetMap::trivial(num_rows),
            LayerInfo::new(&config, config.ml),
        );
        Ok(Self { config, embeddings, upper_layer, lower_layer })
    }

    #[must_use]
    pub fn config(&self) -> &HnswIndexConfig {
        &self.config
    }

    #[must_use]
    pub fn num_rows(&self) -> u64 {
        self.embeddings.num_rows()
    }

    #[must_use]
    pub fn upper_layer(&self) -> &InMemHnswLayer {
        &self.upper_layer
    }

    #[must_use]
    pub fn lower_layer(&self) -> &InMemHnswLayer {
        &self.lower_layer
    }

    /// Node groups covering every row; `finalize` takes indexes below this.
    #[must_use]
    pub fn num_node_groups(&self) -> u64 {
        self.num_rows().div_ceil(NODE_GROUP_SIZE)
    }

    /// Visited-state scratch sized for (upper, lower) layer searches.
    #[must_use]
    pub fn new_visited_states(&self) -> (VisitedState, VisitedState) {
        (VisitedState::new(self.upper_layer.graph().num_nodes()), VisitedState::new(self.lower_layer.graph().num_nodes()))
    }

    /// Inserts row `offset` into the lower layer and, if promoted, the upper
    /// layer. Returns false for a null row, which is skipped.
    pub fn insert(
        &self,
        offset: NodeOffset,
        upper_visited: &mut VisitedState,
        lower_visited: &mut VisitedState,
    ) -> bool {
        let Some(query) = self.embeddings.embedding(offset) else {
            return false;
        };
        let upper_entry = self.upper_layer.entry_point();
        let lower_hint = self.lower_entry_hint(query, upper_entry);
        self.lower_layer.insert(offset, lower_hint, lower_visited);

        if let Some(upper_offset) = self.upper_layer.offset_map().node_to_graph_exact(offset) {
            self.upper_layer.insert(upper_offset, upper_entry, upper_visited);
        }
        true
    }

    /// Inserts every row in parallel. Returns the number of rows inserted.
    pub fn build(&self) -> u64 {
        let num_rows = self.num_rows();
        info!(
            num_rows,
            num_upper_nodes = self.upper_layer.graph().num_nodes(),
            threads = rayon::current_num_threads(),
            "Starting HNSW bulk build"
        );
        let inserted = (0..num_rows)
            .into_par_iter()
            .map_init(
                || self.new_visited_states(),
                |(upper_visited, lower_visited), offset| self.insert(offset, upper_visited, lower_visited),
            )
            .filter(|&inserted| inserted)
            .count() as u64;
        info!(inserted, skipped = num_rows - inserted, "Finished HNSW bulk build");
        inserted
    }

    /// Shrinks over-degree nodes of node group `node_group_idx` in both
    /// layers. Returns the number of nodes shrunk.
    pub fn finalize(&self, node_group_idx: u64) -> usize {
        let num_rows = self.num_rows();
        let upper = self.upper_layer.finalize(node_group_idx, num_rows);
        let lower = self.lower_layer.finalize(node_group_idx, num_rows);
        debug!(node_group_idx, upper, lower, "Finalized node group");
        upper + lower
    }

    /// Finalizes every node group in parallel.
    pub fn finalize_all(&self) -> usize {
        (0..self.num_node_groups()).into_par_iter().map(|group| self.finalize(group)).sum()
    }

    /// Searches the built graph for the `k` rows closest to `query`.
    ///
    /// # Errors
    ///
    /// Returns an error if `k` is zero or `query` has the wrong dimension.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<NodeWithDistance>> {
        if k == 0 {
            anyhow::bail!("k must be positive");
        }
        let dimension = self.embeddings.dimension();
        if query.len() != dimension {
            anyhow::bail!("Query dimension mismatch: expected {dimension}, got {}", query.len());
        }
        let mut entry = self.lower_entry_hint(query, self.upper_layer.entry_point());
        if entry == INVALID_OFFSET {
            entry = self.lower_layer.entry_point();
        }
        let mut visited = VisitedState::new(self.lower_layer.graph().num_nodes());
        Ok(self.lower_layer.search_knn(query, entry, k, ef, &mut visited))
    }

    /// Gives up the built layers for persistence.
    #[must_use]
    pub fn into_partition_state(self) -> HnswPartitionState {
        HnswPartitionState {
            num_rows: self.embeddings.num_rows(),
            upper: BuiltLayer::from_layer(self.upper_layer),
            lower: BuiltLayer::from_layer(self.lower_layer),
        }
    }

    /// Lower-layer node closest to `query` found by greedy upper-layer
    /// descent, or `INVALID_OFFSET` while the upper layer is empty.
    fn lower_entry_hint(&self, query: &[f32], upper_entry: NodeOffset) -> NodeOffset {
        if upper_entry == INVALID_OFFSET {
            return INVALID_OFFSET;
        }
        let closest = self.upper_layer.search_nn(query, upper_entry);
        self.upper_layer.offset_map().graph_to_node(closest)
    }
}

/// A finished layer, read in node offsets.
#[derive(Debug)]
pub struct BuiltLayer {
    graph: InMemHnswGraph,
    offset_map: NodeToGraphOffsetMap,
    info: LayerInfo,
}

impl BuiltLayer {
    fn from_layer(layer: InMemHnswLayer) -> Self {
        let (graph, offset_map, info) = layer.into_parts();
        Self { graph, offset_map, info }
    }

    #[must_use]
    pub fn info(&self) -> &LayerInfo {
        &self.info
    }

    #[must_use]
    pub fn num_nodes_in_graph(&self) -> u64 {
        self.graph.num_nodes()
    }

    #[must_use]
    pub fn graph_to_node(&self, graph_offset: NodeOffset) -> NodeOffset {
        self.offset_map.graph_to_node(graph_offset)
    }

    /// Entry point as a node offset, or `INVALID_OFFSET` for an empty layer.
    #[must_use]
    pub fn entry_point(&self) -> NodeOffset {
        match self.graph.entry_point() {
            INVALID_OFFSET => INVALID_OFFSET,
            graph_offset => self.offset_map.graph_to_node(graph_offset),
        }
    }

    /// Number of stored neighbors of the node at `graph_offset`.
    #[must_use]
    pub fn length(&self, graph_offset: NodeOffset) -> usize {
        self.graph.neighbors(graph_offset).count()
    }

    /// Neighbors of the node at `graph_offset`, as node offsets.
    pub fn neighbors(&self, graph_offset: NodeOffset) -> impl Iterator<Item = NodeOffset> + '_ {
        self.graph.neighbors(graph_offset).map(|nbr| self.offset_map.graph_to_node(nbr))
    }

    /// Every directed edge `(src, dst)` in node offsets.
    pub fn edges(&self) -> impl Iterator<Item = (NodeOffset, NodeOffset)> + '_ {
        (0..self.graph.num_nodes()).flat_map(move |graph_offset| {
            let src = self.offset_map.graph_to_node(graph_offset);
            self.neighbors(graph_offset).map(move |dst| (src, dst))
        })
    }
}

/// Built layers moved out of an [`InMemHnswIndex`].
#[derive(Debug)]
pub struct HnswPartitionState {
    pub num_rows: u64,
    pub upper: BuiltLayer,
    pub lower: BuiltLayer,
}
