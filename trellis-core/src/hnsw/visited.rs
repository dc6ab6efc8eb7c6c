//! Per-search visited markers.

use crate::hnsw::NodeOffset;

/// Visited markers for one layer, reused across searches.
///
/// `reset()` bumps a generation counter instead of zeroing the markers; a
/// full clear happens only when the counter wraps.
#[derive(Debug, Clone)]
pub struct VisitedState {
    marks: Vec<u16>,
    generation: u16,
}

impl VisitedState {
    /// Markers for offsets in `[0, size)`.
    #[must_use]
    pub fn new(size: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let size = size as usize;
        Self { marks: vec![0; size], generation: 1 }
    }

    /// Number of offsets covered
    #[must_use]
    pub fn size(&self) -> u64 {
        self.marks.len() as u64
    }

    /// Forgets every marked offset.
    pub fn reset(&mut self) {
        if self.generation == u16::MAX {
            self.marks.fill(0);
            self.generation = 1;
        } else {
            self.generation += 1;
        }
    }

    /// Forgets every marked offset and covers at least `size` offsets.
    pub fn reset_to_size(&mut self, size: u64) {
        #[allow(clippy::cast_possible_truncation)]
        let size = size as usize;
        if size > self.marks.len() {
            self.marks.resize(size, 0);
        }
        self.reset();
    }

    #[inline]
    pub fn add(&mut self, offset: NodeOffset) {
        self.marks[Self::index(offset)] = self.generation;
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, offset: NodeOffset) -> bool {
        self.marks[Self::index(offset)] == self.generation
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn index(offset: NodeOffset) -> usize {
        offset as usize
    }
}
