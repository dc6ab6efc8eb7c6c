//! Memory-mapped node table holding the indexed embedding column.
//!
//! # File Layout
//!
//! ```text
//! [Header: 4096 bytes] [Row 0] [Row 1] ... [Row n-1]
//! Row = [validity: u32] [f32; dimension]
//! ```
//!
//! A row whose validity word is zero holds no embedding (null or deleted).
//! Row offsets are dense and never reused.

use anyhow::{Context, Result};
use fs2::FileExt;
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::mem;
use std::path::Path;

/// Magic bytes identifying a node table file
pub const MAGIC: &[u8; 8] = b"TRELNODE";

/// Current file format version
pub const VERSION: u32 = 1;

/// Page size for file alignment (4KB)
const PAGE_SIZE: usize = 4096;

/// Sanity bound that catches corrupted headers.
const MAX_DIMENSIONS: u32 = 4096;

const ROW_VALID: u32 = 1;

/// Header page of a node table file.
#[repr(C, align(4096))]
struct Header {
    magic: [u8; 8],
    version: u32,
    dimensions: u32,
    num_rows: u64,
    reserved: [u8; 4072],
}

/// Size of the header in bytes (always one 4KB page)
pub const HEADER_SIZE: usize = mem::size_of::<Header>();

impl Header {
    fn new(dimensions: u32) -> Self {
        Self { magic: *MAGIC, version: VERSION, dimensions, num_rows: 0, reserved: [0; 4072] }
    }

    fn is_valid(&self) -> bool {
        self.magic == *MAGIC
            && self.version > 0
            && self.version <= VERSION
            && self.dimensions > 0
            && self.dimensions <= MAX_DIMENSIONS
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: Header is repr(C), fully initialized and HEADER_SIZE long.
        unsafe { std::slice::from_raw_parts(std::ptr::from_ref(self).cast::<u8>(), HEADER_SIZE) }
    }
}

/// Node table with a single fixed-length float-array column.
#[derive(Debug)]
pub struct NodeTable {
    /// File handle (owns the file lock)
    file: File,

    /// Memory-mapped view of the file
    mmap: MmapMut,
}

impl NodeTable {
    /// Opens or creates a node table file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened or created
    /// - The file is already locked by another process
    /// - The file exists but has a different dimension
    /// - The file is corrupted
    pub fn open<P: AsRef<Path>>(path: P, dimensions: u32) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open node table: {}", path.display()))?;

        file.try_lock_exclusive().context("Node table is already open by another process")?;

        let needs_init = file.metadata().map(|m| m.len() < HEADER_SIZE as u64).unwrap_or(true);
        if needs_init {
            let header = Header::new(dimensions);
            file.set_len(HEADER_SIZE as u64)?;
            // SAFETY: the file is exclusively locked by this process.
            let mut mmap = unsafe { MmapMut::map_mut(&file)? };
            mmap[..HEADER_SIZE].copy_from_slice(header.as_bytes());
            mmap.flush()?;
        }

        // SAFETY: the file is exclusively locked by this process.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        if mmap.len() < HEADER_SIZE || &mmap[..MAGIC.len()] != MAGIC {
            anyhow::bail!("File is not a valid node table: {}", path.display());
        }

        let table = Self { file, mmap };
        if !table.header().is_valid() {
            anyhow::bail!("Corrupted or incompatible node table at {}", path.display());
        }
        if table.header().dimensions != dimensions {
            anyhow::bail!(
                "Dimension mismatch: file has {}, requested {}",
                table.header().dimensions,
                dimensions
            );
        }

        let data_end = table.row_start(table.num_rows())?;
        if table.mmap.len() < data_end {
            anyhow::bail!(
                "Node table is truncated: {} holds {} bytes, {} rows need {}",
                path.display(),
                table.mmap.len(),
                table.num_rows(),
                data_end
            );
        }

        Ok(table)
    }

    /// Appends a row and returns its offset. `None` appends a null row.
    ///
    /// This method does NOT guarantee durability. Call `commit()` for that.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding has the wrong dimension or the file
    /// cannot grow.
    pub fn insert(&mut self, embedding: Option<&[f32]>) -> Result<u64> {
        let dims = self.dimension();
        if let Some(values) = embedding {
            if values.len() != dims {
                anyhow::bail!("Embedding dimension mismatch: expected {}, got {}", dims, values.len());
            }
        }

        let offset = self.header().num_rows;
        let start = self.row_start(offset)?;
        let end = start.checked_add(self.row_stride()).context("Row end offset overflow")?;
        self.ensure_capacity(end)?;

        let row = &mut self.mmap[start..end];
        let (validity, values_bytes) = row.split_at_mut(mem::size_of::<u32>());
        match embedding {
            Some(values) => {
                for (chunk, value) in values_bytes.chunks_exact_mut(4).zip(values) {
                    chunk.copy_from_slice(&value.to_ne_bytes());
                }
                validity.copy_from_slice(&ROW_VALID.to_ne_bytes());
            }
            None => {
                values_bytes.fill(0);
                validity.copy_from_slice(&0_u32.to_ne_bytes());
            }
        }

        // Row data before the header count
        self.header_mut().num_rows = offset + 1;
        Ok(offset)
    }

    /// Marks a row as null. Its offset stays allocated.
    ///
    /// # Errors
    ///
    /// Returns an error if the offset is out of bounds.
    pub fn delete(&mut self, offset: u64) -> Result<()> {
        if offset >= self.num_rows() {
            anyhow::bail!("Row offset out of bounds: {} (num_rows is {})", offset, self.num_rows());
        }
        let start = self.row_start(offset)?;
        self.mmap[start..start + mem::size_of::<u32>()].copy_from_slice(&0_u32.to_ne_bytes());
        Ok(())
    }

    /// Zero-copy view of a row's embedding; `None` if the row is null.
    ///
    /// # Panics
    ///
    /// Panics if `offset >= num_rows()`.
    #[must_use]
    pub fn embedding(&self, offset: u64) -> Option<&[f32]> {
        assert!(
            offset < self.num_rows(),
            "Row offset out of bounds: {} (num_rows is {})",
            offset,
            self.num_rows()
        );
        // In bounds: the row was written by `insert`, which checked the arithmetic.
        #[allow(clippy::cast_possible_truncation)]
        let start = HEADER_SIZE + offset as usize * self.row_stride();
        let validity_bytes: [u8; 4] = self.mmap[start..start + 4].try_into().ok()?;
        if u32::from_ne_bytes(validity_bytes) != ROW_VALID {
            return None;
        }

        let values_start = start + mem::size_of::<u32>();
        debug_assert!(values_start + self.dimension() * 4 <= self.mmap.len());
        // SAFETY:
        // - the row lies inside the mapping (rows < num_rows were written)
        // - HEADER_SIZE and the row stride are multiples of 4, so the values
        //   are f32-aligned
        // - the lifetime is tied to &self, so the map cannot be remapped
        unsafe {
            let ptr = self.mmap.as_ptr().add(values_start).cast::<f32>();
            Some(std::slice::from_raw_parts(ptr, self.dimension()))
        }
    }

    /// Returns true if the row at `offset` has no embedding.
    #[must_use]
    pub fn is_null(&self, offset: u64) -> bool {
        self.embedding(offset).is_none()
    }

    /// Number of rows, null rows included
    #[must_use]
    pub fn num_rows(&self) -> u64 {
        self.header().num_rows
    }

    /// Length of the embedding column
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.header().dimensions as usize
    }

    /// Flushes the map and fsyncs the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn commit(&mut self) -> Result<()> {
        self.mmap.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn row_stride(&self) -> usize {
        mem::size_of::<u32>() + self.dimension() * mem::size_of::<f32>()
    }

    fn row_start(&self, offset: u64) -> Result<usize> {
        let offset = usize::try_from(offset).context("Row offset too large for this platform")?;
        offset
            .checked_mul(self.row_stride())
            .and_then(|bytes| bytes.checked_add(HEADER_SIZE))
            .context("Row offset calculation overflow")
    }

    /// Grows the file to a page boundary covering `required_size`.
    ///
    /// Invalidates every pointer into the map.
    fn ensure_capacity(&mut self, required_size: usize) -> Result<()> {
        if self.mmap.len() >= required_size {
            return Ok(());
        }
        let new_size = (required_size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        self.file.set_len(new_size as u64)?;
        // SAFETY: the file is exclusively locked by this process.
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    fn header(&self) -> &Header {
        // SAFETY: the map is at least HEADER_SIZE bytes and page aligned.
        unsafe { &*self.mmap.as_ptr().cast::<Header>() }
    }

    fn header_mut(&mut self) -> &mut Header {
        // SAFETY: the map is at least HEADER_SIZE bytes and page aligned.
        unsafe { &mut *self.mmap.as_mut_ptr().cast::<Header>() }
    }
}

impl Drop for NodeTable {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
