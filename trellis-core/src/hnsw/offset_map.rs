//! Translation between node-table offsets and compact graph offsets.

use crate::hnsw::NodeOffset;

/// Maps the selected rows of a node table onto `[0, num_nodes_in_graph)`.
///
/// The lower layer selects every row and uses the identity mapping. The
/// upper layer keeps the sorted list of selected rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeToGraphOffsetMap {
    Trivial { num_nodes: u64 },
    Selected { graph_to_node: Vec<NodeOffset> },
}

impl NodeToGraphOffsetMap {
    /// Identity mapping over `num_nodes` rows.
    #[must_use]
    pub fn trivial(num_nodes: u64) -> Self {
        Self::Trivial { num_nodes }
    }

    /// Mapping over the rows for which `selected` is true.
    #[must_use]
    pub fn from_selection(selected: &[bool]) -> Self {
        let graph_to_node = selected
            .iter()
            .enumerate()
            .filter(|&(_, &is_selected)| is_selected)
            .map(|(offset, _)| offset as NodeOffset)
            .collect();
        Self::Selected { graph_to_node }
    }

    #[must_use]
    pub fn num_nodes_in_graph(&self) -> u64 {
        match self {
            Self::Trivial { num_nodes } => *num_nodes,
            Self::Selected { graph_to_node } => graph_to_node.len() as u64,
        }
    }

    #[must_use]
    pub fn is_trivial(&self) -> bool {
        matches!(self, Self::Trivial { .. })
    }

    /// Graph offset of `node`, or of the first selected row after it.
    ///
    /// Row-range bounds translate to graph-range bounds this way.
    #[must_use]
    pub fn node_to_graph(&self, node: NodeOffset) -> NodeOffset {
        match self {
            Self::Trivial { .. } => node,
            Self::Selected { graph_to_node } => graph_to_node.partition_point(|&n| n < node) as NodeOffset,
        }
    }

    /// Graph offset of `node` if the row is selected.
    #[must_use]
    pub fn node_to_graph_exact(&self, node: NodeOffset) -> Option<NodeOffset> {
        match self {
            Self::Trivial { num_nodes } => (node < *num_nodes).then_some(node),
            Self::Selected { graph_to_node } => {
                graph_to_node.binary_search(&node).ok().map(|pos| pos as NodeOffset)
            }
        }
    }

    /// # Panics
    ///
    /// Panics if `graph` is not a graph offset of this map.
    #[must_use]
    pub fn graph_to_node(&self, graph: NodeOffset) -> NodeOffset {
        match self {
            Self::Trivial { .. } => graph,
            #[allow(clippy::cast_possible_truncation)]
            Self::Selected { graph_to_node } => graph_to_node[graph as usize],
        }
    }
}
