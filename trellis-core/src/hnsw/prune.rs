//! Alpha-diversification pruning of neighbor lists.

use crate::distance::DistanceMetric;
use crate::hnsw::{NodeOffset, NodeWithDistance};

/// Distance used whenever one side of a pair has no embedding.
pub(crate) const NULL_DISTANCE: f64 = f64::MAX;

pub(crate) fn distance_or_null(metric: DistanceMetric, a: Option<&[f32]>, b: Option<&[f32]>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => metric.distance(a, b),
        _ => NULL_DISTANCE,
    }
}

/// Picks at most `max_degree` neighbors of a node to keep.
///
/// Candidates are ranked by distance to the node. The nearest one is always
/// kept. Every other candidate `i` is dropped when some farther candidate `j`
/// satisfies `alpha * d(i, j) < d(node, i)`. A non-empty candidate list
/// therefore never prunes down to nothing.
#[must_use]
pub fn select_survivors(
    node_embedding: Option<&[f32]>,
    candidates: &[(NodeOffset, Option<&[f32]>)],
    metric: DistanceMetric,
    alpha: f64,
    max_degree: usize,
) -> Vec<NodeOffset> {
    let mut ranked: Vec<(NodeWithDistance, Option<&[f32]>)> = candidates
        .iter()
        .map(|&(offset, embedding)| {
            let distance = distance_or_null(metric, node_embedding, embedding);
            (NodeWithDistance::new(offset, distance), embedding)
        })
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0));

    let mut survivors = Vec::with_capacity(max_degree.min(ranked.len()));
    for (i, (candidate, embedding)) in ranked.iter().enumerate() {
        if survivors.len() == max_degree {
            break;
        }
        let covered = i > 0
            && ranked[i + 1..].iter().any(|(_, other)| {
                alpha * distance_or_null(metric, *embedding, *other) < candidate.distance
            });
        if !covered {
            survivors.push(candidate.offset);
        }
    }
    survivors
}
