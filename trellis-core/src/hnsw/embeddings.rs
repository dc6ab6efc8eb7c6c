//! Embedding access by node offset.

use crate::hnsw::NodeOffset;
use crate::storage::NodeTable;
use anyhow::Result;

/// Read access to the indexed embedding column.
///
/// A missing embedding (null or deleted row) is `None`, never an error.
/// Offsets at or past `num_rows()` are invariant violations and panic.
pub trait EmbeddingStore: Sync {
    /// Length of every embedding
    fn dimension(&self) -> usize;

    /// Number of rows, null rows included
    fn num_rows(&self) -> u64;

    fn embedding(&self, offset: NodeOffset) -> Option<&[f32]>;

    /// Looks up several offsets at once, in input order.
    fn embeddings(&self, offsets: &[NodeOffset]) -> Vec<Option<&[f32]>> {
        offsets.iter().map(|&offset| self.embedding(offset)).collect()
    }

    fn is_null(&self, offset: NodeOffset) -> bool {
        self.embedding(offset).is_none()
    }
}

/// Embedding column copied into memory once, for bulk builds.
#[derive(Debug, Clone, Default)]
pub struct InMemEmbeddings {
    dimension: usize,
    values: Vec<f32>,
    valid: Vec<bool>,
}

impl InMemEmbeddings {
    /// Scans every row of `table`.
    #[must_use]
    pub fn from_node_table(table: &NodeTable) -> Self {
        let dimension = table.dimension();
        #[allow(clippy::cast_possible_truncation)]
        let num_rows = table.num_rows() as usize;
        let mut values = Vec::with_capacity(num_rows * dimension);
        let mut valid = Vec::with_capacity(num_rows);
        for offset in 0..table.num_rows() {
            match table.embedding(offset) {
                Some(embedding) => {
                    values.extend_from_slice(embedding);
                    valid.push(true);
                }
                None => {
                    values.resize(values.len() + dimension, 0.0);
                    valid.push(false);
                }
            }
        }
        Self { dimension, values, valid }
    }

    /// Builds a column from rows; `None` rows are null.
    ///
    /// # Errors
    ///
    /// Returns an error if a row does not have `dimension` values.
    pub fn from_rows<I>(dimension: usize, rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = Option<Vec<f32>>>,
    {
        let mut embeddings = Self { dimension, values: Vec::new(), valid: Vec::new() };
        for (offset, row) in rows.into_iter().enumerate() {
            match row {
                Some(row) if row.len() == dimension => {
                    embeddings.values.extend_from_slice(&row);
                    embeddings.valid.push(true);
                }
                Some(row) => anyhow::bail!(
                    "Embedding dimension mismatch at row {offset}: expected {dimension}, got {}",
                    row.len()
                ),
                None => {
                    embeddings.values.resize(embeddings.values.len() + dimension, 0.0);
                    embeddings.valid.push(false);
                }
            }
        }
        Ok(embeddings)
    }
}

impl EmbeddingStore for InMemEmbeddings {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn num_rows(&self) -> u64 {
        self.valid.len() as u64
    }

    #[inline]
    fn embedding(&self, offset: NodeOffset) -> Option<&[f32]> {
        #[allow(clippy::cast_possible_truncation)]
        let row = offset as usize;
        assert!(row < self.valid.len(), "Embedding offset out of bounds: {offset}");
        if !self.valid[row] {
            return None;
        }
        let start = row * self.dimension;
        Some(&self.values[start..start + self.dimension])
    }
}

/// Embeddings read straight from the node table's mapped file.
#[derive(Debug, Clone, Copy)]
pub struct OnDiskEmbeddings<'a> {
    table: &'a NodeTable,
}

impl<'a> OnDiskEmbeddings<'a> {
    #[must_use]
    pub fn new(table: &'a NodeTable) -> Self {
        Self { table }
    }
}

impl EmbeddingStore for OnDiskEmbeddings<'_> {
    fn dimension(&self) -> usize {
        self.table.dimension()
    }

    fn num_rows(&self) -> u64 {
        self.table.num_rows()
    }

    #[inline]
    fn embedding(&self, offset: NodeOffset) -> Option<&[f32]> {
        self.table.embedding(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_in_mem_from_rows() {
        let embeddings =
            InMemEmbeddings::from_rows(2, [Some(vec![1.0, 2.0]), None, Some(vec![3.0, 4.0])]).unwrap();

        assert_eq!(embeddings.num_rows(), 3);
        assert_eq!(embeddings.embedding(0), Some(&[1.0, 2.0][..]));
        assert!(embeddings.is_null(1));
        assert_eq!(embeddings.embeddings(&[2, 1]), vec![Some(&[3.0, 4.0][..]), None]);
    }

    #[test]
    fn test_in_mem_rejects_bad_row() {
        let err = InMemEmbeddings::from_rows(3, [Some(vec![1.0])]).unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[test]
    fn test_in_mem_matches_node_table() {
        let temp = NamedTempFile::new().unwrap();
        let mut table = NodeTable::open(temp.path(), 2).unwrap();
        table.insert(Some(&[0.5, 0.25])).unwrap();
        table.insert(None).unwrap();

        let on_disk = OnDiskEmbeddings::new(&table);
        let in_mem = InMemEmbeddings::from_node_table(&table);

        assert_eq!(in_mem.num_rows(), on_disk.num_rows());
        for offset in 0..2 {
            assert_eq!(in_mem.embedding(offset), on_disk.embedding(offset));
        }
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_in_mem_out_of_bounds_panics() {
        let embeddings = InMemEmbeddings::from_rows(1, [Some(vec![1.0])]).unwrap();
        let _ = embeddings.embedding(1);
    }
}
