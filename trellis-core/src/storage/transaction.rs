//! Write transactions over relation tables.

use crate::hnsw::NodeOffset;
use crate::storage::TableId;
use crate::storage::rel_table::LocalRelChanges;
use std::collections::{BTreeMap, BTreeSet};

/// Buffered table creations, edge writes and blob writes, published
/// atomically by
/// [`StorageManager::commit`](crate::storage::StorageManager::commit).
///
/// Dropping a transaction without committing discards its writes.
#[derive(Debug, Default)]
pub struct Transaction {
    id: u64,
    created: BTreeSet<TableId>,
    local: BTreeMap<TableId, LocalRelChanges>,
    blobs: BTreeMap<String, Vec<u8>>,
}

/// Everything a transaction publishes
#[derive(Debug, Default)]
pub(crate) struct WriteSet {
    pub created: BTreeSet<TableId>,
    pub changes: BTreeMap<TableId, LocalRelChanges>,
    pub blobs: BTreeMap<String, Vec<u8>>,
}

impl Transaction {
    pub(crate) fn new(id: u64) -> Self {
        Self { id, ..Self::default() }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn create_table(&mut self, table: TableId) {
        self.created.insert(table);
    }

    /// True if `table` is created by this transaction.
    #[must_use]
    pub fn creates(&self, table: TableId) -> bool {
        self.created.contains(&table)
    }

    /// Buffers a directed edge `src -> dst` in `table`.
    pub fn insert_rel(&mut self, table: TableId, src: NodeOffset, dst: NodeOffset) {
        self.local.entry(table).or_default().insert(src, dst);
    }

    /// Buffers deletion of every outgoing edge of `src` in `table`.
    pub fn detach_delete(&mut self, table: TableId, src: NodeOffset) {
        self.local.entry(table).or_default().detach_delete(src);
    }

    /// Buffers a named blob, replacing any committed blob of that name.
    pub fn put_blob(&mut self, name: &str, bytes: Vec<u8>) {
        self.blobs.insert(name.to_owned(), bytes);
    }

    /// Uncommitted changes to `table`, if any.
    #[must_use]
    pub fn local_changes(&self, table: TableId) -> Option<&LocalRelChanges> {
        self.local.get(&table)
    }

    /// True if the transaction has nothing to publish.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.blobs.is_empty()
            && self.local.values().all(LocalRelChanges::is_empty)
    }

    /// Discards every buffered write.
    pub fn rollback(self) {
        drop(self);
    }

    pub(crate) fn into_write_set(self) -> WriteSet {
        WriteSet { created: self.created, changes: self.local, blobs: self.blobs }
    }
}
