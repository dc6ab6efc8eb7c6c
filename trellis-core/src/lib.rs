//! Trellis - HNSW vector index over node and relation tables
//!
//! Trellis indexes a fixed-length embedding column of a node table with a
//! two-layer HNSW graph whose edges are stored as rows of two relation
//! tables. Indexes are bulk-built in memory in parallel, then maintained
//! incrementally: new rows are searched exhaustively until a checkpoint links
//! them into the persisted graph.
//!
//! # Features
//!
//! - Parallel bulk build over a lock-free adjacency arena
//! - Alpha-diversified neighbor pruning with bounded degree per layer
//! - Transactional, retryable checkpoints of newly inserted rows
//! - Filtered search under a semantic mask, with the traversal strategy
//!   chosen from the mask's selectivity
//!
//! # Example
//!
//! ```no_run
//! use trellis_core::{IndexOptions, VectorIndex};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut index = VectorIndex::open("embeddings.trellis", 768, IndexOptions::default())?;
//!
//! let embedding = vec![0.1; 768];
//! let id = index.add(Some(&embedding))?;
//!
//! // Visible to search right away, linked into the graph here
//! index.checkpoint()?;
//!
//! let results = index.search(&embedding, 10)?;
//! assert_eq!(results[0].offset, id);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod distance;
#[cfg(feature = "internals")]
pub mod hnsw;
#[cfg(not(feature = "internals"))]
pub(crate) mod hnsw;

#[cfg(feature = "internals")]
pub mod storage;
#[cfg(not(feature = "internals"))]
pub(crate) mod storage;
pub mod storage_info;

pub use config::{HnswIndexConfig, QueryHnswConfig};
pub use distance::DistanceMetric;
pub use hnsw::{HnswBuilder, NodeOffset, NodeWithDistance, OnDiskHnswIndex, SemanticMask};
pub use storage::StorageManager;
pub use storage_info::HnswStorageInfo;

use anyhow::Result;
use std::path::Path;
use tracing::debug;

/// Configuration options for [`VectorIndex`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexOptions {
    /// Graph construction options
    pub build: HnswIndexConfig,

    /// Search options
    pub query: QueryHnswConfig,
}

/// Public facade over one storage directory and its HNSW index
#[derive(Debug)]
pub struct VectorIndex {
    storage: StorageManager,
    index: OnDiskHnswIndex,
    options: IndexOptions,
}

impl VectorIndex {
    /// Open or create a vector index in directory `dir`
    ///
    /// A new index starts with empty layers; rows already in the node table
    /// are linked by the first checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The options are invalid
    /// - The directory or its tables cannot be opened
    /// - The persisted storage info is corrupted
    pub fn open<P: AsRef<Path>>(dir: P, dims: u32, options: IndexOptions) -> Result<Self> {
        options.query.validate()?;
        let mut storage = StorageManager::open(dir, dims)?;
        let index = match OnDiskHnswIndex::open(&storage, options.build.clone())? {
            Some(index) => index,
            None => OnDiskHnswIndex::create(&mut storage, options.build.clone())?,
        };
        debug!(
            rows = storage.node_table().num_rows(),
            checkpointed = index.num_checkpointed_nodes(),
            "Opened vector index"
        );
        Ok(Self { storage, index, options })
    }

    /// Bulk-build a fresh index over every row already in `dir`
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be opened, `dir` already holds
    /// an index, or the build fails.
    pub fn build<P: AsRef<Path>>(dir: P, dims: u32, options: IndexOptions) -> Result<Self> {
        options.query.validate()?;
        let mut storage = StorageManager::open(dir, dims)?;
        let index = HnswBuilder::new(options.build.clone()).build(&mut storage)?;
        Ok(Self { storage, index, options })
    }

    /// Append a row; `None` appends a null row, which is never returned
    ///
    /// The row is searchable immediately and joins the graph at the next
    /// [`checkpoint`](Self::checkpoint).
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding has the wrong dimension or the node
    /// table cannot grow.
    pub fn add(&mut self, embedding: Option<&[f32]>) -> Result<NodeOffset> {
        if let Some(embedding) = embedding {
            let dims = self.storage.node_table().dimension();
            if embedding.len() != dims {
                anyhow::bail!("Vector dimension mismatch: expected {}, got {}", dims, embedding.len());
            }
        }
        let offset = self.storage.node_table_mut().insert(embedding)?;
        self.index.insert(offset);
        Ok(offset)
    }

    /// Null out a row's embedding
    ///
    /// # Errors
    ///
    /// Returns an error if the row does not exist.
    pub fn delete(&mut self, offset: NodeOffset) -> Result<()> {
        self.storage.node_table_mut().delete(offset)
    }

    /// Link every pending row into the graph
    ///
    /// The new edges and storage info are committed together. Returns false
    /// if there was nothing to do. A failed checkpoint leaves the index
    /// unchanged and may be retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint transaction fails.
    pub fn checkpoint(&mut self) -> Result<bool> {
        self.index.checkpoint(&mut self.storage)
    }

    /// Search for the k nearest neighbors, ascending by distance
    ///
    /// # Errors
    ///
    /// Returns an error if `k` is zero or the query has the wrong dimension.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<NodeWithDistance>> {
        self.index.search(&self.storage, query, k, &self.options.query, None)
    }

    /// Search for the k nearest neighbors among the rows in `mask`
    ///
    /// # Errors
    ///
    /// Returns an error if `k` is zero or the query has the wrong dimension.
    pub fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        mask: &SemanticMask,
    ) -> Result<Vec<NodeWithDistance>> {
        self.index.search(&self.storage, query, k, &self.options.query, Some(mask))
    }

    /// Flush node table contents to disk
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails
    pub fn flush(&mut self) -> Result<()> {
        self.storage.node_table_mut().commit()
    }

    /// Number of rows, null rows included
    #[must_use]
    pub fn len(&self) -> u64 {
        self.storage.node_table().num_rows()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.storage.node_table().dimension()
    }

    /// Rows linked into the graph by the last checkpoint
    #[must_use]
    pub fn num_checkpointed(&self) -> u64 {
        self.index.num_checkpointed_nodes()
    }

    #[must_use]
    pub fn storage_info(&self) -> &HnswStorageInfo {
        self.index.storage_info()
    }
}
