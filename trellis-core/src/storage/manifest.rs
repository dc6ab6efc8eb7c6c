//! Manifest naming the live relation-table files and the named blobs of a
//! storage directory.
//!
//! Replacing the manifest is the single commit point of the directory. Table
//! files are written under fresh generation-stamped names first; a file the
//! manifest does not reference is not part of the committed state.
//!
//! # File Layout
//!
//! ```text
//! [magic: 8] [version: u32] [generation: u64] [next_table_id: u64]
//! [num_tables: u64] [(table_id: u64, file_generation: u64) × num_tables]
//! [num_blobs: u64] [(name_len: u32, name, data_len: u32, data) × num_blobs]
//! ```

use crate::storage::{NODE_TABLE_ID, TableId};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::warn;

/// Magic bytes identifying a manifest file
pub const MANIFEST_MAGIC: &[u8; 8] = b"TRELMANI";

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 1;

pub(crate) const MANIFEST_FILE: &str = "MANIFEST";
pub(crate) const MANIFEST_TMP_FILE: &str = "MANIFEST.tmp";

/// Committed layout of a storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Manifest {
    /// Bumped by every commit
    pub generation: u64,
    pub next_table_id: TableId,
    /// Table id to the generation its live file was written at
    pub tables: BTreeMap<TableId, u64>,
    pub blobs: BTreeMap<String, Vec<u8>>,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            generation: 0,
            next_table_id: NODE_TABLE_ID + 1,
            tables: BTreeMap::new(),
            blobs: BTreeMap::new(),
        }
    }

    /// Reads the manifest of `dir`; `None` for a directory never committed to.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("Corrupted manifest: {}", path.display()))
            .map(Some)
    }

    /// Writes the manifest to a temporary file, then renames it over the live
    /// one. The rename is the commit point.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(MANIFEST_TMP_FILE);
        {
            let file = File::create(&tmp)
                .with_context(|| format!("Failed to create manifest: {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&self.to_bytes()?)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        let path = dir.join(MANIFEST_FILE);
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(err).with_context(|| format!("Failed to publish manifest: {}", path.display()));
        }
        // Committed once renamed; a failed directory sync only weakens durability
        if let Err(err) = File::open(dir).and_then(|d| d.sync_all()) {
            warn!(error = %err, dir = %dir.display(), "Failed to sync storage directory");
        }
        Ok(())
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(MANIFEST_MAGIC);
        out.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&self.next_table_id.to_le_bytes());
        out.extend_from_slice(&(self.tables.len() as u64).to_le_bytes());
        for (id, generation) in &self.tables {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&generation.to_le_bytes());
        }
        out.extend_from_slice(&(self.blobs.len() as u64).to_le_bytes());
        for (name, data) in &self.blobs {
            let name_len = u32::try_from(name.len()).context("Blob name too long")?;
            let data_len = u32::try_from(data.len()).context("Blob too large")?;
            out.extend_from_slice(&name_len.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&data_len.to_le_bytes());
            out.extend_from_slice(data);
        }
        Ok(out)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.take(MANIFEST_MAGIC.len())? != MANIFEST_MAGIC {
            anyhow::bail!("File is not a manifest");
        }
        let version = reader.u32()?;
        if version == 0 || version > MANIFEST_VERSION {
            anyhow::bail!("Unsupported manifest version: {version}");
        }
        let generation = reader.u64()?;
        let next_table_id = reader.u64()?;

        let mut tables = BTreeMap::new();
        for _ in 0..reader.u64()? {
            let id = reader.u64()?;
            let file_generation = reader.u64()?;
            if id >= next_table_id || file_generation > generation {
                anyhow::bail!("Table {id} at generation {file_generation} is out of range");
            }
            tables.insert(id, file_generation);
        }

        let mut blobs = BTreeMap::new();
        for _ in 0..reader.u64()? {
            let name_len = reader.u32()? as usize;
            let name = String::from_utf8(reader.take(name_len)?.to_vec()).context("Blob name is not UTF-8")?;
            let data_len = reader.u32()? as usize;
            blobs.insert(name, reader.take(data_len)?.to_vec());
        }
        if reader.pos != bytes.len() {
            anyhow::bail!("Trailing bytes after manifest");
        }
        Ok(Self { generation, next_table_id, tables, blobs })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).context("Manifest offset overflow")?;
        let slice = self.bytes.get(self.pos..end).context("Manifest is truncated")?;
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into()?))
    }
}
