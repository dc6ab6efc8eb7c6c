//! Storage the HNSW index is built on: one node table holding the embedding
//! column, relation tables holding graph edges, and write transactions.
//!
//! A storage directory contains:
//!
//! ```text
//! nodes.trellis        node table (see `node_table`)
//! rel_<id>.<gen>.csr   relation table `id` as written by commit `gen`
//! MANIFEST             live table files and named blobs (see `manifest`)
//! ```
//!
//! A commit writes each changed relation table to a new file, flushes the
//! node table, then replaces `MANIFEST`. Files the manifest does not name are
//! leftovers of an interrupted commit and are removed on open.

mod manifest;
mod node_table;
mod rel_table;
mod transaction;

pub use node_table::NodeTable;
pub use rel_table::{LocalRelChanges, NbrBatches, NbrScanState, RelTable};
pub use transaction::Transaction;

use anyhow::{Context, Result};
use manifest::{MANIFEST_TMP_FILE, Manifest};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use transaction::WriteSet;

/// Identifier of a table within one storage directory
pub type TableId = u64;

/// Id of the node table
pub const NODE_TABLE_ID: TableId = 0;

const NODE_TABLE_FILE: &str = "nodes.trellis";

/// Owns the node table and every relation table of a storage directory.
#[derive(Debug)]
pub struct StorageManager {
    dir: PathBuf,
    node_table: NodeTable,
    rel_tables: BTreeMap<TableId, RelTable>,
    manifest: Manifest,
    next_table_id: TableId,
    next_txn_id: u64,
    commit_count: u64,
    read_only: bool,
}

impl StorageManager {
    /// Opens or creates a storage directory with a `dimensions`-wide
    /// embedding column.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory, its manifest, or any table the
    /// manifest names cannot be opened.
    pub fn open<P: AsRef<Path>>(dir: P, dimensions: u32) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage directory: {}", dir.display()))?;

        let node_table = NodeTable::open(dir.join(NODE_TABLE_FILE), dimensions)?;
        let manifest = Manifest::load(&dir)?.unwrap_or_else(Manifest::new);

        let mut rel_tables = BTreeMap::new();
        for (&id, &generation) in &manifest.tables {
            let path = rel_table_path(&dir, id, generation);
            let table = RelTable::load(&path)
                .with_context(|| format!("Failed to load relation table {id}"))?;
            rel_tables.insert(id, table);
        }
        remove_unreferenced_files(&dir, &manifest)?;

        debug!(
            dir = %dir.display(),
            generation = manifest.generation,
            rel_tables = rel_tables.len(),
            "Opened storage"
        );
        Ok(Self {
            dir,
            node_table,
            rel_tables,
            next_table_id: manifest.next_table_id,
            manifest,
            next_txn_id: 1,
            commit_count: 0,
            read_only: false,
        })
    }

    #[must_use]
    pub fn node_table(&self) -> &NodeTable {
        &self.node_table
    }

    pub fn node_table_mut(&mut self) -> &mut NodeTable {
        &mut self.node_table
    }

    /// Creates an empty relation table over the node table and publishes it.
    ///
    /// # Errors
    ///
    /// Returns an error if storage is read-only or the table cannot be
    /// published.
    pub fn create_rel_table(&mut self) -> Result<TableId> {
        if self.read_only {
            anyhow::bail!("Cannot create a relation table: storage is read-only");
        }
        let mut txn = self.begin_write();
        let id = self.create_rel_table_in(&mut txn);
        self.publish(txn).with_context(|| format!("Failed to create relation table {id}"))?;
        Ok(id)
    }

    /// Reserves a relation table that `txn` creates. The table exists once
    /// `txn` commits; a rolled back or failed transaction leaves nothing
    /// behind.
    pub fn create_rel_table_in(&mut self, txn: &mut Transaction) -> TableId {
        let id = self.next_table_id;
        self.next_table_id += 1;
        txn.create_table(id);
        id
    }

    /// Committed state of a relation table.
    ///
    /// # Errors
    ///
    /// Returns an error if no relation table has this id.
    pub fn rel_table(&self, id: TableId) -> Result<&RelTable> {
        self.rel_tables.get(&id).with_context(|| format!("Unknown relation table: {id}"))
    }

    /// Path of the file holding the committed state of relation table `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if no relation table has this id.
    pub fn rel_table_file(&self, id: TableId) -> Result<PathBuf> {
        let generation = self
            .manifest
            .tables
            .get(&id)
            .with_context(|| format!("Unknown relation table: {id}"))?;
        Ok(rel_table_path(&self.dir, id, *generation))
    }

    /// Committed blob stored under `name`.
    #[must_use]
    pub fn blob(&self, name: &str) -> Option<&[u8]> {
        self.manifest.blobs.get(name).map(Vec::as_slice)
    }

    /// Prepares a forward scan of `id`, seeing `txn`'s uncommitted writes if
    /// given.
    ///
    /// # Errors
    ///
    /// Returns an error if no relation table has this id.
    pub fn prepare_scan<'a>(
        &'a self,
        id: TableId,
        txn: Option<&'a Transaction>,
    ) -> Result<NbrScanState<'a>> {
        let local = txn.and_then(|txn| txn.local_changes(id));
        Ok(self.rel_table(id)?.prepare_scan(local))
    }

    /// Starts a write transaction.
    pub fn begin_write(&mut self) -> Transaction {
        let txn = Transaction::new(self.next_txn_id);
        self.next_txn_id += 1;
        txn
    }

    /// Publishes every write of `txn`, or none of them.
    ///
    /// Changed tables are written to new files first; replacing the manifest
    /// publishes them together with the transaction's blobs.
    ///
    /// # Errors
    ///
    /// Returns an error if storage is read-only, the transaction touches an
    /// unknown table, or a file cannot be written. Committed state, in memory
    /// and on disk, is unchanged on error.
    pub fn commit(&mut self, txn: Transaction) -> Result<()> {
        if self.read_only {
            anyhow::bail!("Cannot commit transaction {}: storage is read-only", txn.id());
        }
        self.publish(txn)?;
        self.commit_count += 1;
        Ok(())
    }

    /// Makes every later commit fail until cleared.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of successful commits since this manager was opened
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commit_count
    }

    /// Generation of the committed manifest; bumped by every publish.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.manifest.generation
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn publish(&mut self, txn: Transaction) -> Result<()> {
        let txn_id = txn.id();
        let WriteSet { created, changes, blobs } = txn.into_write_set();

        let mut updated = BTreeMap::new();
        for &id in &created {
            updated.insert(id, RelTable::new());
        }
        for (id, changes) in changes {
            if changes.is_empty() {
                continue;
            }
            let merged = match updated.get(&id) {
                Some(fresh) => fresh.merged(&changes),
                None => self.rel_table(id)?.merged(&changes),
            };
            updated.insert(id, merged);
        }

        let mut next = self.manifest.clone();
        next.generation += 1;
        if let Some(&last) = created.last() {
            next.next_table_id = next.next_table_id.max(last + 1);
        }
        next.blobs.extend(blobs);

        let mut written = Vec::with_capacity(updated.len());
        if let Err(err) = self.write_generation(&updated, &mut next, &mut written) {
            remove_files(&written);
            return Err(err.context(format!("Failed to commit transaction {txn_id}")));
        }

        // Published; files of the previous generation are garbage now
        let obsolete: Vec<PathBuf> = updated
            .keys()
            .filter_map(|id| {
                self.manifest.tables.get(id).map(|&generation| rel_table_path(&self.dir, *id, generation))
            })
            .collect();
        self.manifest = next;
        let num_tables = updated.len();
        self.rel_tables.extend(updated);
        remove_files(&obsolete);

        debug!(
            txn = txn_id,
            generation = self.manifest.generation,
            tables = num_tables,
            created = created.len(),
            "Committed transaction"
        );
        Ok(())
    }

    /// Writes the new files of `next.generation`, recording each in
    /// `written` before it is created, then publishes `next`.
    fn write_generation(
        &mut self,
        updated: &BTreeMap<TableId, RelTable>,
        next: &mut Manifest,
        written: &mut Vec<PathBuf>,
    ) -> Result<()> {
        for (&id, table) in updated {
            let path = rel_table_path(&self.dir, id, next.generation);
            written.push(path.clone());
            table.save(&path)?;
            next.tables.insert(id, next.generation);
        }
        self.node_table.commit()?;
        next.save(&self.dir)
    }
}

fn rel_table_path(dir: &Path, id: TableId, generation: u64) -> PathBuf {
    dir.join(format!("rel_{id}.{generation}.csr"))
}

/// Table id and generation encoded in a relation-table file name.
fn rel_table_file_id(path: &Path) -> Option<(TableId, u64)> {
    let name = path.file_name()?.to_str()?;
    let (id, generation) = name.strip_prefix("rel_")?.strip_suffix(".csr")?.split_once('.')?;
    Some((id.parse().ok()?, generation.parse().ok()?))
}

fn is_rel_table_temp(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("rel_") && name.ends_with(".tmp"))
}

/// Deletes relation-table files and temporaries the manifest does not name.
fn remove_unreferenced_files(dir: &Path, manifest: &Manifest) -> Result<()> {
    let mut stale = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let referenced = rel_table_file_id(&path)
            .map(|(id, generation)| manifest.tables.get(&id) == Some(&generation));
        let is_stale = match referenced {
            Some(referenced) => !referenced,
            None => is_rel_table_temp(&path) || path.file_name().is_some_and(|name| name == MANIFEST_TMP_FILE),
        };
        if is_stale && path.is_file() {
            stale.push(path);
        }
    }
    if !stale.is_empty() {
        debug!(dir = %dir.display(), files = stale.len(), "Removing files of an unfinished commit");
    }
    remove_files(&stale);
    Ok(())
}

/// Best-effort removal of `paths` and their staging temporaries.
fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        for candidate in [path.clone(), path.with_extension("tmp")] {
            match fs::remove_file(&candidate) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(error = %err, file = %candidate.display(), "Failed to remove file"),
            }
        }
    }
}
