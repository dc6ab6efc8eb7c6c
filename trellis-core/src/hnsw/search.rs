//! Greedy descent and the mask-aware beam search shared by every layer.
//!
//! # Filtered search
//!
//! With a semantic mask, only masked nodes may enter the results. How far
//! the search looks past unmasked nodes depends on how many nodes are masked:
//!
//! | selectivity              | strategy           |
//! |--------------------------|--------------------|
//! | `< blind threshold`      | `BlindTwoHop`      |
//! | `< directed threshold`   | `DirectedTwoHop`   |
//! | otherwise                | `OneHopFiltered`   |
//!
//! Two-hop strategies stop exploring once `two_hop_budget` neighbors have
//! been visited in one expansion step.

use crate::config::{FILTERED_SEARCH_INITIAL_CANDIDATES, QueryHnswConfig};
use crate::distance::DistanceMetric;
use crate::hnsw::prune::{NULL_DISTANCE, distance_or_null};
use crate::hnsw::{
    INVALID_OFFSET, MaxNodeQueue, MinNodeQueue, NodeOffset, NodeWithDistance, SemanticMask,
    VisitedState, pop_top_k,
};
use std::cmp::Reverse;
use tracing::debug;

/// Read access to one layer's nodes for search.
///
/// Offsets are in the layer's own offset space.
pub trait LayerView {
    /// Offsets of this layer lie in `[0, num_nodes)`.
    fn num_nodes(&self) -> u64;

    fn embedding(&self, node: NodeOffset) -> Option<&[f32]>;

    /// Replaces the contents of `out` with the neighbors of `node`.
    fn neighbors(&self, node: NodeOffset, out: &mut Vec<NodeOffset>);
}

/// Traversal strategy of a beam search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    BlindTwoHop,
    DirectedTwoHop,
    OneHopFiltered,
    Unfiltered,
}

impl SearchType {
    /// Picks a strategy from the fraction of the layer's nodes that are masked.
    #[must_use]
    pub fn select(mask: Option<&SemanticMask>, num_nodes: u64, config: &QueryHnswConfig) -> Self {
        let Some(mask) = mask else {
            return Self::Unfiltered;
        };
        #[allow(clippy::cast_precision_loss)]
        let selectivity =
            if num_nodes == 0 { 1.0 } else { mask.num_masked() as f64 / num_nodes as f64 };
        let search_type = if selectivity < config.blind_search_up_sel_threshold {
            Self::BlindTwoHop
        } else if selectivity < config.directed_search_up_sel_threshold {
            Self::DirectedTwoHop
        } else {
            Self::OneHopFiltered
        };
        debug!(selectivity, ?search_type, "Selected filtered search strategy");
        search_type
    }
}

/// Per-call beam search options.
#[derive(Debug, Clone, Copy)]
pub struct SearchParams<'a> {
    pub k: usize,
    /// Beam width; the effective width is `max(k, ef)`
    pub ef: usize,
    pub search_type: SearchType,
    /// Admissible results; ignored by `SearchType::Unfiltered`
    pub mask: Option<&'a SemanticMask>,
    /// Neighbors a two-hop expansion step may visit
    pub two_hop_budget: usize,
}

impl SearchParams<'_> {
    #[must_use]
    pub fn unfiltered(k: usize, ef: usize) -> Self {
        Self { k, ef, search_type: SearchType::Unfiltered, mask: None, two_hop_budget: 0 }
    }
}

/// Greedy descent: moves to the closest strictly-closer neighbor until none
/// exists. Returns `INVALID_OFFSET` for an invalid entry.
pub fn search_nn<L: LayerView + ?Sized>(
    layer: &L,
    metric: DistanceMetric,
    query: &[f32],
    entry: NodeOffset,
) -> NodeOffset {
    if entry == INVALID_OFFSET {
        return INVALID_OFFSET;
    }
    let mut current = entry;
    let mut min_dist = distance_or_null(metric, Some(query), layer.embedding(current));
    let mut last_min_dist = f64::INFINITY;
    let mut nbrs = Vec::new();
    while min_dist < last_min_dist {
        last_min_dist = min_dist;
        layer.neighbors(current, &mut nbrs);
        for &nbr in &nbrs {
            let dist = distance_or_null(metric, Some(query), layer.embedding(nbr));
            if dist < min_dist {
                min_dist = dist;
                current = nbr;
            }
        }
    }
    current
}

/// Beam search for the `k` nodes closest to `query`, ascending by distance.
///
/// Nodes without an embedding are traversed but never returned. An invalid
/// entry yields no results.
pub fn search_knn<L: LayerView + ?Sized>(
    layer: &L,
    metric: DistanceMetric,
    query: &[f32],
    entry: NodeOffset,
    params: &SearchParams<'_>,
    visited: &mut VisitedState,
) -> Vec<NodeWithDistance> {
    if entry == INVALID_OFFSET || params.k == 0 {
        return Vec::new();
    }
    visited.reset_to_size(layer.num_nodes());

    let mut search = BeamSearch {
        layer,
        metric,
        query,
        mask: params.mask,
        filtered: params.search_type != SearchType::Unfiltered,
        ef: params.k.max(params.ef),
        two_hop_budget: params.two_hop_budget,
        visited,
        candidates: MinNodeQueue::new(),
        results: MaxNodeQueue::new(),
        second_hop_nbrs: Vec::new(),
    };
    search.seed_entry(entry);
    if search.filtered {
        search.seed_masked();
    }

    let mut nbrs = Vec::new();
    while let Some(&Reverse(candidate)) = search.candidates.peek() {
        if search.results.len() >= search.ef && candidate.distance > search.worst() {
            break;
        }
        search.candidates.pop();
        layer.neighbors(candidate.offset, &mut nbrs);
        match params.search_type {
            SearchType::Unfiltered | SearchType::OneHopFiltered => search.one_hop(&nbrs),
            SearchType::DirectedTwoHop => search.directed_two_hop(&nbrs),
            SearchType::BlindTwoHop => search.blind_two_hop(&nbrs),
        }
    }
    pop_top_k(search.results, params.k)
}

struct BeamSearch<'a, L: ?Sized> {
    layer: &'a L,
    metric: DistanceMetric,
    query: &'a [f32],
    mask: Option<&'a SemanticMask>,
    filtered: bool,
    ef: usize,
    two_hop_budget: usize,
    visited: &'a mut VisitedState,
    candidates: MinNodeQueue,
    results: MaxNodeQueue,
    second_hop_nbrs: Vec<NodeOffset>,
}

impl<L: LayerView + ?Sized> BeamSearch<'_, L> {
    fn distance(&self, node: NodeOffset) -> f64 {
        distance_or_null(self.metric, Some(self.query), self.layer.embedding(node))
    }

    fn is_masked(&self, node: NodeOffset) -> bool {
        !self.filtered || self.mask.is_none_or(|mask| mask.is_masked(node))
    }

    fn worst(&self) -> f64 {
        self.results.peek().map_or(f64::INFINITY, |worst| worst.distance)
    }

    fn has_room_for(&self, distance: f64) -> bool {
        self.results.len() < self.ef || distance < self.worst()
    }

    fn push_result(&mut self, node: NodeWithDistance) {
        if self.results.len() >= self.ef {
            self.results.pop();
        }
        self.results.push(node);
        self.candidates.push(Reverse(node));
    }

    /// Admits a freshly visited node if it improves the results.
    fn admit(&mut self, node: NodeOffset, distance: f64) {
        if distance == NULL_DISTANCE {
            self.candidates.push(Reverse(NodeWithDistance::new(node, distance)));
            return;
        }
        if self.has_room_for(distance) {
            self.push_result(NodeWithDistance::new(node, distance));
        }
    }

    fn seed_entry(&mut self, entry: NodeOffset) {
        let distance = self.distance(entry);
        self.visited.add(entry);
        self.candidates.push(Reverse(NodeWithDistance::new(entry, distance)));
        if self.is_masked(entry) && distance != NULL_DISTANCE {
            self.results.push(NodeWithDistance::new(entry, distance));
        }
    }

    fn seed_masked(&mut self) {
        let Some(mask) = self.mask else {
            return;
        };
        let wanted = FILTERED_SEARCH_INITIAL_CANDIDATES.saturating_sub(self.results.len());
        for candidate in mask.collect_masked(wanted, self.layer.num_nodes()) {
            if self.visited.contains(candidate) {
                continue;
            }
            self.visited.add(candidate);
            let distance = self.distance(candidate);
            let node = NodeWithDistance::new(candidate, distance);
            self.candidates.push(Reverse(node));
            if distance != NULL_DISTANCE {
                self.results.push(node);
            }
        }
    }

    fn one_hop(&mut self, nbrs: &[NodeOffset]) {
        for &nbr in nbrs {
            if !self.visited.contains(nbr) && self.is_masked(nbr) {
                self.visited.add(nbr);
                let distance = self.distance(nbr);
                self.admit(nbr, distance);
            }
        }
    }

    fn blind_two_hop(&mut self, nbrs: &[NodeOffset]) {
        let mut num_visited = 0;
        let mut second_hop = Vec::with_capacity(nbrs.len());
        for &nbr in nbrs {
            if self.visited.contains(nbr) {
                continue;
            }
            second_hop.push(nbr);
            if self.is_masked(nbr) {
                num_visited += 1;
                self.visited.add(nbr);
                let distance = self.distance(nbr);
                self.admit(nbr, distance);
            }
        }
        for candidate in second_hop {
            if !self.expand_second_hop(candidate, &mut num_visited) {
                return;
            }
        }
    }

    fn directed_two_hop(&mut self, nbrs: &[NodeOffset]) {
        let mut num_visited = 0;
        let mut second_hop = MinNodeQueue::new();
        for &nbr in nbrs {
            if self.visited.contains(nbr) {
                continue;
            }
            let distance = self.distance(nbr);
            second_hop.push(Reverse(NodeWithDistance::new(nbr, distance)));
            if self.is_masked(nbr) && distance != NULL_DISTANCE && self.has_room_for(distance) {
                num_visited += 1;
                self.visited.add(nbr);
                self.push_result(NodeWithDistance::new(nbr, distance));
            }
        }
        while let Some(Reverse(candidate)) = second_hop.pop() {
            if !self.expand_second_hop(candidate.offset, &mut num_visited) {
                return;
            }
        }
    }

    /// Visits the masked neighbors of `candidate`. Returns false once the
    /// two-hop budget is spent.
    fn expand_second_hop(&mut self, candidate: NodeOffset, num_visited: &mut usize) -> bool {
        if *num_visited >= self.two_hop_budget {
            return false;
        }
        if self.visited.contains(candidate) {
            return true;
        }
        self.visited.add(candidate);

        let mut nbrs = std::mem::take(&mut self.second_hop_nbrs);
        self.layer.neighbors(candidate, &mut nbrs);
        let mut within_budget = true;
        for &nbr in &nbrs {
            if !self.visited.contains(nbr) && self.is_masked(nbr) {
                self.visited.add(nbr);
                let distance = self.distance(nbr);
                self.admit(nbr, distance);
                *num_visited += 1;
                if *num_visited >= self.two_hop_budget {
                    within_budget = false;
                    break;
                }
            }
        }
        self.second_hop_nbrs = nbrs;
        within_budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Points on a line with explicit adjacency.
    struct LineLayer {
        points: Vec<Option<Vec<f32>>>,
        adjacency: Vec<Vec<NodeOffset>>,
    }

    impl LineLayer {
        fn complete(n: usize) -> Self {
            let points = (0..n).map(|i| Some(vec![i as f32])).collect();
            let adjacency = (0..n as NodeOffset)
                .map(|i| (0..n as NodeOffset).filter(|&j| j != i).collect())
                .collect();
            Self { points, adjacency }
        }

        fn chain(n: usize) -> Self {
            let points = (0..n).map(|i| Some(vec![i as f32])).collect();
            let adjacency = (0..n as NodeOffset)
                .map(|i| {
                    let mut nbrs = Vec::new();
                    if i > 0 {
                        nbrs.push(i - 1);
                    }
                    if i + 1 < n as NodeOffset {
                        nbrs.push(i + 1);
                    }
                    nbrs
                })
                .collect();
            Self { points, adjacency }
        }
    }

    impl LayerView for LineLayer {
        fn num_nodes(&self) -> u64 {
            self.points.len() as u64
        }

        fn embedding(&self, node: NodeOffset) -> Option<&[f32]> {
            self.points[node as usize].as_deref()
        }

        fn neighbors(&self, node: NodeOffset, out: &mut Vec<NodeOffset>) {
            out.clear();
            out.extend_from_slice(&self.adjacency[node as usize]);
        }
    }

    fn offsets(results: &[NodeWithDistance]) -> Vec<NodeOffset> {
        results.iter().map(|n| n.offset).collect()
    }

    #[test]
    fn test_exact_on_complete_graph() {
        let layer = LineLayer::complete(20);
        let mut visited = VisitedState::new(20);
        let params = SearchParams::unfiltered(4, 20);

        let results = search_knn(&layer, DistanceMetric::L2, &[7.2], 0, &params, &mut visited);
        assert_eq!(offsets(&results), vec![7, 8, 6, 9]);
        assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_search_nn_descends_chain() {
        let layer = LineLayer::chain(50);
        assert_eq!(search_nn(&layer, DistanceMetric::L2, &[31.4], 0), 31);
        assert_eq!(search_nn(&layer, DistanceMetric::L2, &[0.0], INVALID_OFFSET), INVALID_OFFSET);
    }

    #[test]
    fn test_invalid_entry_or_zero_k_is_empty() {
        let layer = LineLayer::chain(3);
        let mut visited = VisitedState::new(3);
        let params = SearchParams::unfiltered(2, 10);
        assert!(search_knn(&layer, DistanceMetric::L2, &[1.0], INVALID_OFFSET, &params, &mut visited).is_empty());

        let zero = SearchParams::unfiltered(0, 10);
        assert!(search_knn(&layer, DistanceMetric::L2, &[1.0], 0, &zero, &mut visited).is_empty());
    }

    #[test]
    fn test_null_entry_still_traverses() {
        let mut layer = LineLayer::chain(10);
        layer.points[0] = None;
        let mut visited = VisitedState::new(10);
        let params = SearchParams::unfiltered(2, 10);

        let results = search_knn(&layer, DistanceMetric::L2, &[5.0], 0, &params, &mut visited);
        assert_eq!(offsets(&results), vec![5, 4]);
    }

    #[test]
    fn test_one_hop_filtered_returns_only_masked() {
        let layer = LineLayer::complete(30);
        let mask: SemanticMask = (0..30).filter(|o| o % 2 == 1).collect();
        let mut visited = VisitedState::new(30);
        let params = SearchParams {
            k: 3,
            ef: 30,
            search_type: SearchType::OneHopFiltered,
            mask: Some(&mask),
            two_hop_budget: 8,
        };

        let results = search_knn(&layer, DistanceMetric::L2, &[10.1], 0, &params, &mut visited);
        assert_eq!(offsets(&results), vec![11, 9, 13]);
    }

    #[test]
    fn test_two_hop_crosses_unmasked_gap() {
        // Every third node of a chain is masked; the entry is unmasked.
        let layer = LineLayer::chain(90);
        let mask: SemanticMask = (0..90).filter(|o| o % 3 == 0).collect();

        for search_type in [SearchType::BlindTwoHop, SearchType::DirectedTwoHop] {
            let mut visited = VisitedState::new(90);
            let params = SearchParams { k: 2, ef: 4, search_type, mask: Some(&mask), two_hop_budget: 8 };
            let results = search_knn(&layer, DistanceMetric::L2, &[70.0], 68, &params, &mut visited);

            assert_eq!(results.first().map(|n| n.offset), Some(69), "{search_type:?}");
            assert!(results.iter().all(|n| mask.is_masked(n.offset)));
        }
    }

    #[test]
    fn test_filtered_seeding_bounded() {
        let layer = LineLayer::chain(100);
        let mask: SemanticMask = (50..100).collect();
        let mut visited = VisitedState::new(100);
        let params = SearchParams {
            k: 1,
            ef: 1,
            search_type: SearchType::OneHopFiltered,
            mask: Some(&mask),
            two_hop_budget: 8,
        };

        let results = search_knn(&layer, DistanceMetric::L2, &[99.0], 0, &params, &mut visited);
        assert_eq!(results.len(), 1);
        assert!(mask.is_masked(results[0].offset));
    }

    #[test]
    fn test_strategy_selection() {
        let config = QueryHnswConfig::default();
        let sparse: SemanticMask = (0..5).collect();
        let medium: SemanticMask = (0..20).collect();
        let dense: SemanticMask = (0..90).collect();

        assert_eq!(SearchType::select(None, 100, &config), SearchType::Unfiltered);
        assert_eq!(SearchType::select(Some(&sparse), 100, &config), SearchType::BlindTwoHop);
        assert_eq!(SearchType::select(Some(&medium), 100, &config), SearchType::DirectedTwoHop);
        assert_eq!(SearchType::select(Some(&dense), 100, &config), SearchType::OneHopFiltered);
        assert_eq!(SearchType::select(Some(&sparse), 0, &config), SearchType::OneHopFiltered);
    }
}
