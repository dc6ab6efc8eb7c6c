//! Adjacency storage of one in-memory HNSW layer.
//!
//! # Layout
//!
//! ```text
//! dsts:    [node 0: capacity slots] [node 1: capacity slots] ...
//! lengths: [node 0] [node 1] ...
//! ```
//!
//! Slot `s` of node `n` lives at `n * capacity + s`. Unused slots hold
//! `INVALID_OFFSET`. Bulk-build workers share the arena: a node's length is
//! claimed with an atomic fetch-add and the entry point is published with a
//! compare-and-swap. No other synchronization exists.

use crate::hnsw::{INVALID_OFFSET, NodeOffset};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Fixed-capacity adjacency arena shared by bulk-build workers.
#[derive(Debug)]
pub struct InMemHnswGraph {
    num_nodes: u64,
    capacity: usize,
    dsts: Box<[AtomicU64]>,
    lengths: Box<[AtomicU32]>,
    entry_point: AtomicU64,
}

impl InMemHnswGraph {
    /// Allocates `num_nodes` rows of `capacity` slots each.
    #[must_use]
    pub fn new(num_nodes: u64, capacity: usize) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let rows = num_nodes as usize;
        let dsts = (0..rows * capacity).map(|_| AtomicU64::new(INVALID_OFFSET)).collect();
        let lengths = (0..rows).map(|_| AtomicU32::new(0)).collect();
        Self { num_nodes, capacity, dsts, lengths, entry_point: AtomicU64::new(INVALID_OFFSET) }
    }

    #[must_use]
    pub fn num_nodes(&self) -> u64 {
        self.num_nodes
    }

    /// Slots per neighbor row
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Flat arena index of `slot` in `node`'s row.
    #[inline]
    #[must_use]
    pub fn slot_index(&self, node: NodeOffset, slot: usize) -> usize {
        assert!(node < self.num_nodes, "Graph offset out of bounds: {node} (num_nodes is {})", self.num_nodes);
        #[allow(clippy::cast_possible_truncation)]
        let start = node as usize * self.capacity;
        start + slot
    }

    /// Claims the next slot of `node` and returns the previous length.
    ///
    /// The returned length may be `>= capacity()` under concurrent inserts;
    /// such a slot does not exist and the caller must not write it.
    #[inline]
    pub fn increment_length(&self, node: NodeOffset) -> usize {
        self.lengths[Self::row(node)].fetch_add(1, Ordering::AcqRel) as usize
    }

    #[inline]
    pub fn set_neighbor(&self, flat_index: usize, dst: NodeOffset) {
        assert!(flat_index < self.dsts.len(), "Neighbor slot out of bounds: {flat_index}");
        self.dsts[flat_index].store(dst, Ordering::Release);
    }

    /// Stored length of `node`'s row, which may exceed `capacity()`.
    #[inline]
    #[must_use]
    pub fn length(&self, node: NodeOffset) -> usize {
        self.lengths[Self::row(node)].load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn set_length(&self, node: NodeOffset, length: usize) {
        debug_assert!(length <= self.capacity);
        #[allow(clippy::cast_possible_truncation)]
        self.lengths[Self::row(node)].store(length as u32, Ordering::Release);
    }

    /// Neighbors of `node`, bounded by its length and the first unused slot.
    pub fn neighbors(&self, node: NodeOffset) -> impl Iterator<Item = NodeOffset> + '_ {
        let start = self.slot_index(node, 0);
        let len = self.length(node).min(self.capacity);
        self.dsts[start..start + len]
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .take_while(|&dst| dst != INVALID_OFFSET)
    }

    /// Publishes `candidate` as entry point if the layer has none.
    ///
    /// Returns `INVALID_OFFSET` if `candidate` won, or the entry point
    /// already in place.
    pub fn compare_and_swap_entry_point(&self, candidate: NodeOffset) -> NodeOffset {
        match self.entry_point.compare_exchange(
            INVALID_OFFSET,
            candidate,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => INVALID_OFFSET,
            Err(current) => current,
        }
    }

    #[must_use]
    pub fn entry_point(&self) -> NodeOffset {
        self.entry_point.load(Ordering::Acquire)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn row(node: NodeOffset) -> usize {
        node as usize
    }
}
