//! Directed relation table in CSR form.
//!
//! Committed edges live in two arrays: `offsets[src]..offsets[src + 1]` is the
//! range of `dsts` holding the neighbors of `src`. Uncommitted edges live in a
//! transaction's [`LocalRelChanges`] and are merged over the committed CSR by
//! [`NbrScanState`] at read time.
//!
//! # File Layout
//!
//! ```text
//! [magic: 8] [version: u32] [num_nodes: u64] [num_edges: u64]
//! [offsets: u64 × (num_nodes + 1)] [dsts: u64 × num_edges]
//! ```

use crate::hnsw::NodeOffset;
use anyhow::{Context, Result};
use memmap2::Mmap;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Magic bytes identifying a relation table file
pub const REL_MAGIC: &[u8; 8] = b"TRELREL\0";

/// Current relation table format version
pub const REL_VERSION: u32 = 1;

const REL_HEADER_SIZE: usize = 8 + 4 + 8 + 8;

/// Neighbors handed out per batch by [`NbrBatches`].
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 64;

/// Committed directed edges `{src, dst}` over one node table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelTable {
    offsets: Vec<u64>,
    dsts: Vec<NodeOffset>,
}

impl Default for RelTable {
    fn default() -> Self {
        Self { offsets: vec![0], dsts: Vec::new() }
    }
}

impl RelTable {
    /// Creates a table with no edges.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of source nodes covered by the CSR
    #[must_use]
    pub fn num_nodes(&self) -> u64 {
        self.offsets.len() as u64 - 1
    }

    /// Number of committed edges
    #[must_use]
    pub fn num_edges(&self) -> usize {
        self.dsts.len()
    }

    /// Committed neighbors of `src`, empty for nodes past the CSR.
    #[must_use]
    pub fn committed_neighbors(&self, src: NodeOffset) -> &[NodeOffset] {
        let Ok(src) = usize::try_from(src) else {
            return &[];
        };
        if src + 1 >= self.offsets.len() {
            return &[];
        }
        #[allow(clippy::cast_possible_truncation)]
        let (start, end) = (self.offsets[src] as usize, self.offsets[src + 1] as usize);
        &self.dsts[start..end]
    }

    /// Prepares a forward scan, optionally overlaid with uncommitted changes.
    #[must_use]
    pub fn prepare_scan<'a>(&'a self, local: Option<&'a LocalRelChanges>) -> NbrScanState<'a> {
        NbrScanState { table: self, local, batch_size: DEFAULT_SCAN_BATCH_SIZE }
    }

    /// Returns the table with `changes` applied, leaving `self` untouched.
    #[must_use]
    pub fn merged(&self, changes: &LocalRelChanges) -> Self {
        let num_nodes = changes
            .inserted
            .keys()
            .map(|&src| src + 1)
            .chain(std::iter::once(self.num_nodes()))
            .max()
            .unwrap_or(0);

        let mut offsets = Vec::with_capacity(num_nodes as usize + 1);
        let mut dsts = Vec::with_capacity(self.dsts.len() + changes.num_inserted());
        offsets.push(0);
        let scan = self.prepare_scan(Some(changes));
        for src in 0..num_nodes {
            for batch in scan.scan_forward(src) {
                dsts.extend_from_slice(batch);
            }
            offsets.push(dsts.len() as u64);
        }
        Self { offsets, dsts }
    }

    /// Writes the table to `path` through a temporary file and a rename.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let file = File::create(&tmp)
                .with_context(|| format!("Failed to create relation table: {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            writer.write_all(REL_MAGIC)?;
            writer.write_all(&REL_VERSION.to_le_bytes())?;
            writer.write_all(&self.num_nodes().to_le_bytes())?;
            writer.write_all(&(self.dsts.len() as u64).to_le_bytes())?;
            for value in self.offsets.iter().chain(&self.dsts) {
                writer.write_all(&value.to_le_bytes())?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to publish relation table: {}", path.display()))?;
        Ok(())
    }

    /// Reads a table written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, truncated or not a relation
    /// table.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open relation table: {}", path.display()))?;
        // SAFETY: the file is only replaced by rename, never written in place.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < REL_HEADER_SIZE || &mmap[..8] != REL_MAGIC {
            anyhow::bail!("File is not a valid relation table: {}", path.display());
        }
        let read_u64 = |at: usize| -> Result<u64> {
            let bytes = mmap.get(at..at + 8).context("Relation table is truncated")?;
            Ok(u64::from_le_bytes(bytes.try_into()?))
        };
        let version = u32::from_le_bytes(mmap[8..12].try_into()?);
        if version == 0 || version > REL_VERSION {
            anyhow::bail!("Unsupported relation table version: {version}");
        }
        let num_nodes = usize::try_from(read_u64(12)?)?;
        let num_edges = usize::try_from(read_u64(20)?)?;

        let expected = (num_nodes + 1 + num_edges)
            .checked_mul(8)
            .and_then(|body| body.checked_add(REL_HEADER_SIZE))
            .context("Relation table size overflow")?;
        if mmap.len() != expected {
            anyhow::bail!(
                "Relation table size mismatch: {} bytes, expected {}",
                mmap.len(),
                expected
            );
        }

        let values = (0..num_nodes + 1 + num_edges)
            .map(|i| read_u64(REL_HEADER_SIZE + i * 8))
            .collect::<Result<Vec<u64>>>()?;
        let (offsets, dsts) = values.split_at(num_nodes + 1);
        if offsets.windows(2).any(|w| w[0] > w[1]) || offsets.last() != Some(&(num_edges as u64)) {
            anyhow::bail!("Corrupted relation table offsets: {}", path.display());
        }

        Ok(Self { offsets: offsets.to_vec(), dsts: dsts.to_vec() })
    }
}

/// Uncommitted edge changes of one relation table inside a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalRelChanges {
    inserted: HashMap<NodeOffset, Vec<NodeOffset>>,
    detached: HashSet<NodeOffset>,
}

impl LocalRelChanges {
    /// Records a new directed edge.
    pub fn insert(&mut self, src: NodeOffset, dst: NodeOffset) {
        self.inserted.entry(src).or_default().push(dst);
    }

    /// Deletes every outgoing edge of `src`, committed or local.
    pub fn detach_delete(&mut self, src: NodeOffset) {
        self.detached.insert(src);
        self.inserted.remove(&src);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.detached.is_empty()
    }

    fn num_inserted(&self) -> usize {
        self.inserted.values().map(Vec::len).sum()
    }
}

/// Scan state for forward neighbor lookups over one relation table.
#[derive(Debug, Clone, Copy)]
pub struct NbrScanState<'a> {
    table: &'a RelTable,
    local: Option<&'a LocalRelChanges>,
    batch_size: usize,
}

impl<'a> NbrScanState<'a> {
    /// Sets the number of neighbors per batch.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Forward neighbors of `node` as batches of offsets.
    #[must_use]
    pub fn scan_forward(&self, node: NodeOffset) -> NbrBatches<'a> {
        let (committed, local): (&'a [NodeOffset], &'a [NodeOffset]) = match self.local {
            Some(local) => (
                if local.detached.contains(&node) {
                    &[]
                } else {
                    self.table.committed_neighbors(node)
                },
                local.inserted.get(&node).map_or(&[], Vec::as_slice),
            ),
            None => (self.table.committed_neighbors(node), &[]),
        };
        NbrBatches { committed, local, batch_size: self.batch_size }
    }
}

/// Batched iterator over a node's forward neighbors.
#[derive(Debug, Clone)]
pub struct NbrBatches<'a> {
    committed: &'a [NodeOffset],
    local: &'a [NodeOffset],
    batch_size: usize,
}

impl NbrBatches<'_> {
    /// Number of neighbors not yet yielded, without iterating.
    #[must_use]
    pub fn num_neighbors(&self) -> usize {
        self.committed.len() + self.local.len()
    }
}

impl<'a> Iterator for NbrBatches<'a> {
    type Item = &'a [NodeOffset];

    fn next(&mut self) -> Option<Self::Item> {
        let source = if self.committed.is_empty() { &mut self.local } else { &mut self.committed };
        let remaining: &'a [NodeOffset] = *source;
        if remaining.is_empty() {
            return None;
        }
        let (batch, rest) = remaining.split_at(self.batch_size.min(remaining.len()));
        *source = rest;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn collect(scan: &NbrScanState<'_>, node: NodeOffset) -> Vec<NodeOffset> {
        scan.scan_forward(node).flatten().copied().collect()
    }

    fn table_with(edges: &[(NodeOffset, NodeOffset)]) -> RelTable {
        let mut changes = LocalRelChanges::default();
        for &(src, dst) in edges {
            changes.insert(src, dst);
        }
        RelTable::new().merged(&changes)
    }

    #[test]
    fn test_merge_builds_csr() {
        let table = table_with(&[(0, 1), (0, 2), (2, 0)]);

        assert_eq!(table.num_nodes(), 3);
        assert_eq!(table.num_edges(), 3);
        assert_eq!(table.committed_neighbors(0), &[1, 2]);
        assert!(table.committed_neighbors(1).is_empty());
        assert_eq!(table.committed_neighbors(2), &[0]);
        assert!(table.committed_neighbors(99).is_empty());
    }

    #[test]
    fn test_local_changes_overlay_committed() {
        let table = table_with(&[(0, 1), (0, 2), (1, 0)]);
        let mut local = LocalRelChanges::default();
        local.detach_delete(0);
        local.insert(0, 3);
        local.insert(1, 3);

        let scan = table.prepare_scan(Some(&local));
        assert_eq!(collect(&scan, 0), vec![3]);
        assert_eq!(collect(&scan, 1), vec![0, 3]);

        // Committed view is untouched
        assert_eq!(collect(&table.prepare_scan(None), 0), vec![1, 2]);
    }

    #[test]
    fn test_detach_discards_earlier_local_inserts() {
        let mut local = LocalRelChanges::default();
        local.insert(4, 1);
        local.detach_delete(4);
        local.insert(4, 2);

        let table = RelTable::new();
        assert_eq!(collect(&table.prepare_scan(Some(&local)), 4), vec![2]);
    }

    #[test]
    fn test_batches_and_count() {
        let edges: Vec<_> = (1..=10).map(|dst| (0, dst)).collect();
        let table = table_with(&edges);
        let mut local = LocalRelChanges::default();
        local.insert(0, 11);

        let scan = table.prepare_scan(Some(&local)).with_batch_size(4);
        let batches = scan.scan_forward(0);
        assert_eq!(batches.num_neighbors(), 11);

        let sizes: Vec<usize> = batches.map(<[NodeOffset]>::len).collect();
        assert_eq!(sizes, vec![4, 4, 2, 1]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rel.csr");
        let table = table_with(&[(0, 5), (3, 1), (3, 2)]);

        table.save(&path).unwrap();
        assert_eq!(RelTable::load(&path).unwrap(), table);

        RelTable::new().save(&path).unwrap();
        assert_eq!(RelTable::load(&path).unwrap().num_edges(), 0);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.csr");
        std::fs::write(&path, b"not a relation table at all").unwrap();
        assert!(RelTable::load(&path).is_err());
        assert!(RelTable::load(&dir.path().join("missing.csr")).is_err());
    }
}
