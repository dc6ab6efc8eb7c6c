//! Persisted metadata of an HNSW index.
//!
//! # Layout
//!
//! ```text
//! [magic: 8] [version: u32] [upper_rel_table_id: u64] [lower_rel_table_id: u64]
//! [upper_entry_point: u64] [lower_entry_point: u64] [num_checkpointed_nodes: u64]
//! ```
//!
//! All integers are little-endian.

use crate::hnsw::{INVALID_OFFSET, NodeOffset};
use crate::storage::TableId;
use anyhow::{Context, Result};

/// Magic bytes identifying serialized HNSW storage info
pub const STORAGE_INFO_MAGIC: &[u8; 8] = b"TRELHNSW";

/// Current storage-info format version
pub const STORAGE_INFO_VERSION: u32 = 1;

/// Metadata needed to reopen an on-disk HNSW index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswStorageInfo {
    pub upper_rel_table_id: TableId,
    pub lower_rel_table_id: TableId,
    pub upper_entry_point: NodeOffset,
    pub lower_entry_point: NodeOffset,
    /// Low-water mark: rows at or past this offset have no persisted edges.
    pub num_checkpointed_nodes: u64,
}

impl HnswStorageInfo {
    /// Serialized size in bytes
    pub const SIZE: usize = 8 + 4 + 5 * 8;

    /// Storage info of an index with empty layers and nothing checkpointed.
    #[must_use]
    pub const fn empty(upper_rel_table_id: TableId, lower_rel_table_id: TableId) -> Self {
        Self {
            upper_rel_table_id,
            lower_rel_table_id,
            upper_entry_point: INVALID_OFFSET,
            lower_entry_point: INVALID_OFFSET,
            num_checkpointed_nodes: 0,
        }
    }

    /// Serializes the fields in their fixed order.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(STORAGE_INFO_MAGIC);
        bytes.extend_from_slice(&STORAGE_INFO_VERSION.to_le_bytes());
        for field in [
            self.upper_rel_table_id,
            self.lower_rel_table_id,
            self.upper_entry_point,
            self.lower_entry_point,
            self.num_checkpointed_nodes,
        ] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    /// Deserializes bytes produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is truncated, has the wrong magic, or
    /// carries an unsupported version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            anyhow::bail!(
                "Buffer too small for HNSW storage info: {} bytes, need {}",
                bytes.len(),
                Self::SIZE
            );
        }
        if &bytes[..8] != STORAGE_INFO_MAGIC {
            anyhow::bail!("Invalid HNSW storage info: bad magic");
        }
        let version = u32::from_le_bytes(bytes[8..12].try_into().context("Invalid version bytes")?);
        if version == 0 || version > STORAGE_INFO_VERSION {
            anyhow::bail!("Unsupported HNSW storage info version: {version}");
        }

        let mut fields = [0_u64; 5];
        for (i, field) in fields.iter_mut().enumerate() {
            let start = 12 + i * 8;
            *field = u64::from_le_bytes(
                bytes[start..start + 8].try_into().context("Invalid storage info field")?,
            );
        }
        let [upper_rel_table_id, lower_rel_table_id, upper_entry_point, lower_entry_point, num_checkpointed_nodes] =
            fields;

        Ok(Self {
            upper_rel_table_id,
            lower_rel_table_id,
            upper_entry_point,
            lower_entry_point,
            num_checkpointed_nodes,
        })
    }
}
