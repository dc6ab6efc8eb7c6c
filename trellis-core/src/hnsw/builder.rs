use crate::config::HnswIndexConfig;
use crate::hnsw::on_disk::ensure_no_index;
use crate::hnsw::{BuiltLayer, InMemEmbeddings, InMemHnswIndex, OnDiskHnswIndex, STORAGE_INFO_BLOB};
use crate::storage::{StorageManager, TableId, Transaction};
use crate::storage_info::HnswStorageInfo;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Builder for constructing an HNSW index over every row of a node table
pub struct HnswBuilder {
    config: HnswIndexConfig,
}

impl HnswBuilder {
    #[must_use]
    pub fn new(config: HnswIndexConfig) -> Self {
        Self { config }
    }

    /// Builds the graph in memory, then persists it into two new relation
    /// tables in one transaction. The same transaction creates the tables
    /// and commits the storage info, so a failed build leaves no trace.
    ///
    /// The returned index has every row present at build time checkpointed.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid, `storage` already holds an
    /// index, or the transaction cannot be committed.
    pub fn build(self, storage: &mut StorageManager) -> Result<OnDiskHnswIndex> {
        self.config.validate()?;
        ensure_no_index(storage)?;
        let embeddings = Arc::new(InMemEmbeddings::from_node_table(storage.node_table()));
        let index = InMemHnswIndex::new(embeddings, self.config.clone())?;
        index.build();
        let num_shrunk = index.finalize_all();
        let state = index.into_partition_state();

        let mut txn = storage.begin_write();
        let upper_rel_table_id = storage.create_rel_table_in(&mut txn);
        let lower_rel_table_id = storage.create_rel_table_in(&mut txn);
        let upper_edges = write_layer(&mut txn, upper_rel_table_id, &state.upper);
        let lower_edges = write_layer(&mut txn, lower_rel_table_id, &state.lower);
        let info = HnswStorageInfo {
            upper_rel_table_id,
            lower_rel_table_id,
            upper_entry_point: state.upper.entry_point(),
            lower_entry_point: state.lower.entry_point(),
            num_checkpointed_nodes: state.num_rows,
        };
        txn.put_blob(STORAGE_INFO_BLOB, info.to_bytes());
        storage.commit(txn).context("Failed to persist HNSW layers")?;

        info!(
            rows = state.num_rows,
            upper_edges,
            lower_edges,
            num_shrunk,
            "Persisted HNSW index"
        );
        OnDiskHnswIndex::from_storage_info(info, self.config)
    }
}

fn write_layer(txn: &mut Transaction, table: TableId, layer: &BuiltLayer) -> usize {
    let mut num_edges = 0;
    for (src, dst) in layer.edges() {
        txn.insert_rel(table, src, dst);
        num_edges += 1;
    }
    num_edges
}
