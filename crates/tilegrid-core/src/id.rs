//! Chunk addressing for tiled grids.
//!
//! A grid of `n_rows x n_cols` cells is split into tiles of
//! `chunk_rows x chunk_cols` cells. The last chunk row and the last chunk
//! column may be smaller than the default extent. Every global cell maps to
//! exactly one [`ChunkId`] and one local position inside that chunk.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ChunkError, ChunkResult};

/// Most cells one chunk may hold. Sparse encodings address cells as `u32`.
pub const MAX_CHUNK_CELLS: usize = u32::MAX as usize;

/// Number of cells in a `rows x cols` chunk, if that is a valid extent.
pub fn chunk_cells(rows: usize, cols: usize) -> ChunkResult<usize> {
    rows.checked_mul(cols)
        .filter(|cells| *cells <= MAX_CHUNK_CELLS)
        .ok_or_else(|| {
            ChunkError::InvalidShape(format!(
                "a {}x{} chunk holds more than {} cells",
                rows, cols, MAX_CHUNK_CELLS
            ))
        })
}

/// Coordinate of a chunk in the grid.
///
/// Ordered by chunk row, then chunk column, which is the row-major order
/// grids iterate their chunks in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    /// Which block of rows (row / chunk_rows)
    pub row: u64,
    /// Which block of columns (col / chunk_cols)
    pub col: u64,
}

impl ChunkId {
    pub const fn new(row: u64, col: u64) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Dimensions of a grid and its chunk tiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLayout {
    n_rows: u64,
    n_cols: u64,
    chunk_rows: usize,
    chunk_cols: usize,
}

impl ChunkLayout {
    /// Create a layout. Chunk extents must be non-zero and hold at most
    /// [`MAX_CHUNK_CELLS`] cells.
    pub fn new(
        n_rows: u64,
        n_cols: u64,
        chunk_rows: usize,
        chunk_cols: usize,
    ) -> ChunkResult<Self> {
        if chunk_rows == 0 || chunk_cols == 0 {
            return Err(ChunkError::InvalidShape(format!(
                "chunk extent {}x{} must be non-zero",
                chunk_rows, chunk_cols
            )));
        }
        chunk_cells(chunk_rows, chunk_cols)?;
        Ok(Self {
            n_rows,
            n_cols,
            chunk_rows,
            chunk_cols,
        })
    }

    pub fn n_rows(&self) -> u64 {
        self.n_rows
    }

    pub fn n_cols(&self) -> u64 {
        self.n_cols
    }

    /// Default number of rows in a chunk.
    pub fn chunk_rows(&self) -> usize {
        self.chunk_rows
    }

    /// Default number of columns in a chunk.
    pub fn chunk_cols(&self) -> usize {
        self.chunk_cols
    }

    /// Number of chunk rows, counting a trailing partial row.
    pub fn n_chunk_rows(&self) -> u64 {
        self.n_rows.div_ceil(self.chunk_rows as u64)
    }

    /// Number of chunk columns, counting a trailing partial column.
    pub fn n_chunk_cols(&self) -> u64 {
        self.n_cols.div_ceil(self.chunk_cols as u64)
    }

    pub fn n_chunks(&self) -> u64 {
        self.n_chunk_rows() * self.n_chunk_cols()
    }

    pub fn contains(&self, row: u64, col: u64) -> bool {
        row < self.n_rows && col < self.n_cols
    }

    pub fn contains_chunk(&self, id: ChunkId) -> bool {
        id.row < self.n_chunk_rows() && id.col < self.n_chunk_cols()
    }

    /// Chunk holding the global cell. The caller checks bounds.
    pub fn chunk_id(&self, row: u64, col: u64) -> ChunkId {
        ChunkId {
            row: row / self.chunk_rows as u64,
            col: col / self.chunk_cols as u64,
        }
    }

    /// Position of a global cell within its chunk.
    pub fn to_local(&self, row: u64, col: u64) -> (usize, usize) {
        (
            (row % self.chunk_rows as u64) as usize,
            (col % self.chunk_cols as u64) as usize,
        )
    }

    /// Global coordinates of a chunk-local position.
    pub fn to_global(&self, id: ChunkId, local_row: usize, local_col: usize) -> (u64, u64) {
        (
            id.row * self.chunk_rows as u64 + local_row as u64,
            id.col * self.chunk_cols as u64 + local_col as u64,
        )
    }

    /// Actual `(rows, cols)` of a chunk; edge chunks may be smaller.
    pub fn extent(&self, id: ChunkId) -> (usize, usize) {
        let first_row = id.row * self.chunk_rows as u64;
        let first_col = id.col * self.chunk_cols as u64;
        let rows = self.n_rows.saturating_sub(first_row).min(self.chunk_rows as u64);
        let cols = self.n_cols.saturating_sub(first_col).min(self.chunk_cols as u64);
        (rows as usize, cols as usize)
    }

    /// All chunk ids in row-major order.
    pub fn ids(&self) -> impl Iterator<Item = ChunkId> {
        let n_chunk_cols = self.n_chunk_cols();
        (0..self.n_chunk_rows())
            .flat_map(move |row| (0..n_chunk_cols).map(move |col| ChunkId { row, col }))
    }
}
