//! Semantic masks for pre-filtered vector search.

use crate::hnsw::NodeOffset;
use roaring::RoaringTreemap;

/// Set of node offsets a filtered search may return.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SemanticMask {
    offsets: RoaringTreemap,
}

impl SemanticMask {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mask(&mut self, offset: NodeOffset) {
        self.offsets.insert(offset);
    }

    #[must_use]
    pub fn is_masked(&self, offset: NodeOffset) -> bool {
        self.offsets.contains(offset)
    }

    #[must_use]
    pub fn num_masked(&self) -> u64 {
        self.offsets.len()
    }

    /// Up to `n` masked offsets below `limit`, ascending.
    #[must_use]
    pub fn collect_masked(&self, n: usize, limit: NodeOffset) -> Vec<NodeOffset> {
        self.offsets.iter().take_while(|&offset| offset < limit).take(n).collect()
    }

    /// Masked offsets in `[start, end)`, ascending.
    pub fn masked_in_range(
        &self,
        start: NodeOffset,
        end: NodeOffset,
    ) -> impl Iterator<Item = NodeOffset> + '_ {
        self.offsets.iter().skip_while(move |&offset| offset < start).take_while(move |&offset| offset < end)
    }
}

impl FromIterator<NodeOffset> for SemanticMask {
    fn from_iter<I: IntoIterator<Item = NodeOffset>>(iter: I) -> Self {
        Self { offsets: iter.into_iter().collect() }
    }
}
