//! HNSW index whose layers live in two relation tables.
//!
//! Rows below the low-water mark (`num_checkpointed_nodes`) have persisted
//! edges; rows past it are found by an exact scan until the next
//! [`checkpoint`](OnDiskHnswIndex::checkpoint) links them into the graph.
//! Every offset here, edges and entry points included, is a node offset.

use crate::config::{HnswIndexConfig, QueryHnswConfig};
use crate::hnsw::{
    EmbeddingStore, INVALID_OFFSET, LayerView, NodeOffset, NodeWithDistance, OnDiskEmbeddings,
    SearchParams, SearchType, SemanticMask, VisitedState, search_knn, search_nn, select_survivors,
};
use crate::storage::{NbrScanState, StorageManager, TableId, Transaction};
use crate::storage_info::HnswStorageInfo;
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Name of the storage blob holding the committed [`HnswStorageInfo`]
pub const STORAGE_INFO_BLOB: &str = "hnsw.info";

/// One persisted layer, read through a relation-table scan.
struct PersistentLayer<'a> {
    scan: NbrScanState<'a>,
    embeddings: OnDiskEmbeddings<'a>,
    num_nodes: u64,
}

impl<'a> PersistentLayer<'a> {
    fn open(
        storage: &'a StorageManager,
        table: TableId,
        txn: Option<&'a Transaction>,
        num_nodes: u64,
    ) -> Result<Self> {
        Ok(Self {
            scan: storage.prepare_scan(table, txn)?,
            embeddings: OnDiskEmbeddings::new(storage.node_table()),
            num_nodes,
        })
    }

    fn degree(&self, node: NodeOffset) -> usize {
        self.scan.scan_forward(node).num_neighbors()
    }
}

impl LayerView for PersistentLayer<'_> {
    fn num_nodes(&self) -> u64 {
        self.num_nodes
    }

    fn embedding(&self, node: NodeOffset) -> Option<&[f32]> {
        self.embeddings.embedding(node)
    }

    fn neighbors(&self, node: NodeOffset, out: &mut Vec<NodeOffset>) {
        out.clear();
        for batch in self.scan.scan_forward(node) {
            out.extend_from_slice(batch);
        }
    }
}

/// Layer being written by a checkpoint.
#[derive(Debug, Clone, Copy)]
struct LayerTarget {
    table: TableId,
    max_degree: usize,
}

/// Entry points and deferred shrinks of a checkpoint in progress. Applied
/// to the index only if the checkpoint commits.
#[derive(Debug)]
struct CheckpointState {
    upper_entry_point: NodeOffset,
    lower_entry_point: NodeOffset,
    upper_to_shrink: BTreeSet<NodeOffset>,
    lower_to_shrink: BTreeSet<NodeOffset>,
    num_inserted: u64,
    num_promoted: u64,
}

/// Checkpointed HNSW index over a [`StorageManager`].
#[derive(Debug, Clone)]
pub struct OnDiskHnswIndex {
    info: HnswStorageInfo,
    config: HnswIndexConfig,
    rng: StdRng,
}

impl OnDiskHnswIndex {
    /// Creates an index with two fresh, empty relation tables. Every
    /// existing row is left for the first checkpoint.
    ///
    /// The tables and the storage info are published in one commit.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid, `storage` already holds an
    /// index, or the commit fails.
    pub fn create(storage: &mut StorageManager, config: HnswIndexConfig) -> Result<Self> {
        config.validate()?;
        ensure_no_index(storage)?;
        let mut txn = storage.begin_write();
        let upper = storage.create_rel_table_in(&mut txn);
        let lower = storage.create_rel_table_in(&mut txn);
        let info = HnswStorageInfo::empty(upper, lower);
        txn.put_blob(STORAGE_INFO_BLOB, info.to_bytes());
        storage.commit(txn).context("Failed to create HNSW layers")?;
        Self::from_storage_info(info, config)
    }

    /// Reopens the index whose storage info is committed to `storage`;
    /// `None` if it holds no index.
    ///
    /// # Errors
    ///
    /// Returns an error if the committed storage info is invalid.
    pub fn open(storage: &StorageManager, config: HnswIndexConfig) -> Result<Option<Self>> {
        storage
            .blob(STORAGE_INFO_BLOB)
            .map(|bytes| Self::load(storage, bytes, config))
            .transpose()
    }

    /// Wraps existing storage info.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn from_storage_info(info: HnswStorageInfo, config: HnswIndexConfig) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self { info, config, rng })
    }

    /// Reopens an index from bytes produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are malformed, a referenced relation
    /// table does not exist, or the low-water mark is past the node table.
    pub fn load(storage: &StorageManager, bytes: &[u8], config: HnswIndexConfig) -> Result<Self> {
        let info = HnswStorageInfo::from_bytes(bytes)?;
        storage.rel_table(info.upper_rel_table_id).context("Missing upper layer table")?;
        storage.rel_table(info.lower_rel_table_id).context("Missing lower layer table")?;
        let num_rows = storage.node_table().num_rows();
        if info.num_checkpointed_nodes > num_rows {
            anyhow::bail!(
                "Corrupted HNSW storage info: {} checkpointed nodes but the table has {num_rows} rows",
                info.num_checkpointed_nodes
            );
        }
        Self::from_storage_info(info, config)
    }

    #[must_use]
    pub fn storage_info(&self) -> &HnswStorageInfo {
        &self.info
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.info.to_bytes()
    }

    #[must_use]
    pub fn config(&self) -> &HnswIndexConfig {
        &self.config
    }

    /// Rows with persisted edges
    #[must_use]
    pub fn num_checkpointed_nodes(&self) -> u64 {
        self.info.num_checkpointed_nodes
    }

    /// Does nothing: new rows are found by exact scan until the next
    /// checkpoint gives them edges.
    pub fn insert(&mut self, _offset: NodeOffset) {}

    /// Finds the `k` rows closest to `query`.
    ///
    /// Checkpointed rows are searched through the graph, restricted to
    /// `mask` if given; newer rows are scanned exhaustively. Null rows are
    /// never returned.
    ///
    /// # Errors
    ///
    /// Returns an error if `k` is zero, `query` has the wrong dimension,
    /// `query_config` is invalid, or a layer table is missing.
    pub fn search(
        &self,
        storage: &StorageManager,
        query: &[f32],
        k: usize,
        query_config: &QueryHnswConfig,
        mask: Option<&SemanticMask>,
    ) -> Result<Vec<NodeWithDistance>> {
        if k == 0 {
            anyhow::bail!("k must be positive");
        }
        query_config.validate()?;
        let dimension = storage.node_table().dimension();
        if query.len() != dimension {
            anyhow::bail!("Query dimension mismatch: expected {dimension}, got {}", query.len());
        }

        let mut results = self.search_from_checkpointed(storage, query, k, query_config, mask)?;
        results.extend(self.search_from_uncheckpointed(storage, query, mask));
        results.sort();
        results.truncate(k);
        Ok(results)
    }

    fn search_from_checkpointed(
        &self,
        storage: &StorageManager,
        query: &[f32],
        k: usize,
        query_config: &QueryHnswConfig,
        mask: Option<&SemanticMask>,
    ) -> Result<Vec<NodeWithDistance>> {
        let num_nodes = self.info.num_checkpointed_nodes;
        if self.info.lower_entry_point == INVALID_OFFSET {
            return Ok(Vec::new());
        }
        let metric = self.config.metric;
        let upper = PersistentLayer::open(storage, self.info.upper_rel_table_id, None, num_nodes)?;
        let lower = PersistentLayer::open(storage, self.info.lower_rel_table_id, None, num_nodes)?;

        let entry = match self.info.upper_entry_point {
            INVALID_OFFSET => self.info.lower_entry_point,
            upper_entry => search_nn(&upper, metric, query, upper_entry),
        };
        let params = SearchParams {
            k,
            ef: query_config.efs,
            search_type: SearchType::select(mask, num_nodes, query_config),
            mask,
            two_hop_budget: self.config.ml,
        };
        let mut visited = VisitedState::new(num_nodes);
        Ok(search_knn(&lower, metric, query, entry, &params, &mut visited))
    }

    fn search_from_uncheckpointed(
        &self,
        storage: &StorageManager,
        query: &[f32],
        mask: Option<&SemanticMask>,
    ) -> Vec<NodeWithDistance> {
        let table = storage.node_table();
        (self.info.num_checkpointed_nodes..table.num_rows())
            .filter(|&offset| mask.is_none_or(|mask| mask.is_masked(offset)))
            .filter_map(|offset| {
                let embedding = table.embedding(offset)?;
                Some(NodeWithDistance::new(offset, self.config.metric.distance(query, embedding)))
            })
            .collect()
    }

    /// Links every row past the low-water mark into the graph in one
    /// transaction, which also commits the new storage info.
    ///
    /// Returns `Ok(false)` without writing anything if no row is pending.
    /// On failure the transaction is rolled back and the index is left as it
    /// was, so the checkpoint can be retried.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer table is missing or the commit fails.
    pub fn checkpoint(&mut self, storage: &mut StorageManager) -> Result<bool> {
        let start = self.info.num_checkpointed_nodes;
        let end = storage.node_table().num_rows();
        if start >= end {
            debug!(num_checkpointed_nodes = start, "Nothing to checkpoint");
            return Ok(false);
        }

        let rng_snapshot = self.rng.clone();
        let mut txn = storage.begin_write();
        let outcome = match self.insert_pending_rows(storage, &mut txn, start, end) {
            Ok(state) => {
                let next_info = HnswStorageInfo {
                    upper_entry_point: state.upper_entry_point,
                    lower_entry_point: state.lower_entry_point,
                    num_checkpointed_nodes: end,
                    ..self.info
                };
                txn.put_blob(STORAGE_INFO_BLOB, next_info.to_bytes());
                storage.commit(txn).map(|()| (state, next_info))
            }
            Err(err) => {
                txn.rollback();
                Err(err)
            }
        };
        let (state, next_info) = match outcome {
            Ok(committed) => committed,
            Err(err) => {
                self.rng = rng_snapshot;
                warn!(error = %err, start, end, "Checkpoint rolled back");
                return Err(err.context("HNSW checkpoint failed"));
            }
        };

        self.info = next_info;
        info!(
            rows = end - start,
            inserted = state.num_inserted,
            promoted = state.num_promoted,
            upper_shrunk = state.upper_to_shrink.len(),
            lower_shrunk = state.lower_to_shrink.len(),
            num_checkpointed_nodes = end,
            "Checkpointed HNSW index"
        );
        Ok(true)
    }

    fn insert_pending_rows(
        &mut self,
        storage: &StorageManager,
        txn: &mut Transaction,
        start: NodeOffset,
        end: NodeOffset,
    ) -> Result<CheckpointState> {
        let upper = LayerTarget { table: self.info.upper_rel_table_id, max_degree: self.config.mu };
        let lower = LayerTarget { table: self.info.lower_rel_table_id, max_degree: self.config.ml };
        let mut state = CheckpointState {
            upper_entry_point: self.info.upper_entry_point,
            lower_entry_point: self.info.lower_entry_point,
            upper_to_shrink: BTreeSet::new(),
            lower_to_shrink: BTreeSet::new(),
            num_inserted: 0,
            num_promoted: 0,
        };
        let mut visited = VisitedState::new(end);
        let table = storage.node_table();

        for offset in start..end {
            let Some(query) = table.embedding(offset) else {
                continue;
            };
            let promoted = self.rng.random_bool(self.config.pu);

            let lower_hint = match state.upper_entry_point {
                INVALID_OFFSET => INVALID_OFFSET,
                upper_entry => {
                    let layer = PersistentLayer::open(storage, upper.table, Some(&*txn), end)?;
                    search_nn(&layer, self.config.metric, query, upper_entry)
                }
            };
            self.insert_to_layer(
                storage,
                txn,
                lower,
                offset,
                query,
                lower_hint,
                &mut state.lower_entry_point,
                &mut state.lower_to_shrink,
                &mut visited,
            )?;
            if promoted {
                let upper_hint = state.upper_entry_point;
                self.insert_to_layer(
                    storage,
                    txn,
                    upper,
                    offset,
                    query,
                    upper_hint,
                    &mut state.upper_entry_point,
                    &mut state.upper_to_shrink,
                    &mut visited,
                )?;
                state.num_promoted += 1;
            }
            state.num_inserted += 1;
        }

        for (target, to_shrink) in [(upper, &state.upper_to_shrink), (lower, &state.lower_to_shrink)] {
            for &node in to_shrink {
                self.shrink_for_node(storage, txn, target, node, end)?;
            }
        }
        Ok(state)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_to_layer(
        &self,
        storage: &StorageManager,
        txn: &mut Transaction,
        target: LayerTarget,
        offset: NodeOffset,
        query: &[f32],
        entry_hint: NodeOffset,
        entry_point: &mut NodeOffset,
        to_shrink: &mut BTreeSet<NodeOffset>,
        visited: &mut VisitedState,
    ) -> Result<()> {
        let entry = match (entry_hint, *entry_point) {
            (INVALID_OFFSET, INVALID_OFFSET) => {
                *entry_point = offset;
                return Ok(());
            }
            (INVALID_OFFSET, current) => current,
            (hint, _) => hint,
        };

        let closest = {
            let layer = PersistentLayer::open(storage, target.table, Some(&*txn), offset + 1)?;
            let params = SearchParams::unfiltered(target.max_degree, self.config.efc);
            search_knn(&layer, self.config.metric, query, entry, &params, visited)
        };
        for nbr in &closest {
            if nbr.offset == offset {
                continue;
            }
            create_rels(txn, target.table, offset, nbr.offset);
        }

        let layer = PersistentLayer::open(storage, target.table, Some(&*txn), offset + 1)?;
        for nbr in closest {
            if layer.degree(nbr.offset) > target.max_degree {
                to_shrink.insert(nbr.offset);
            }
        }
        Ok(())
    }

    /// Replaces `node`'s outgoing edges with its pruned survivors.
    fn shrink_for_node(
        &self,
        storage: &StorageManager,
        txn: &mut Transaction,
        target: LayerTarget,
        node: NodeOffset,
        num_nodes: u64,
    ) -> Result<()> {
        let survivors = {
            let layer = PersistentLayer::open(storage, target.table, Some(&*txn), num_nodes)?;
            let mut nbrs = Vec::new();
            layer.neighbors(node, &mut nbrs);
            let candidates: Vec<_> = nbrs.iter().copied().zip(layer.embeddings.embeddings(&nbrs)).collect();
            select_survivors(
                layer.embedding(node),
                &candidates,
                self.config.metric,
                self.config.alpha,
                target.max_degree,
            )
        };
        txn.detach_delete(target.table, node);
        for survivor in survivors {
            txn.insert_rel(target.table, node, survivor);
        }
        Ok(())
    }
}

/// Fails if `storage` already has a committed index.
pub(crate) fn ensure_no_index(storage: &StorageManager) -> Result<()> {
    if storage.blob(STORAGE_INFO_BLOB).is_some() {
        anyhow::bail!("An HNSW index already exists in {}", storage.dir().display());
    }
    Ok(())
}

/// Writes the edge in both directions.
fn create_rels(txn: &mut Transaction, table: TableId, a: NodeOffset, b: NodeOffset) {
    txn.insert_rel(table, a, b);
    txn.insert_rel(table, b, a);
}
