//! Chunk storage.
//!
//! A [`Chunk`] owns the cells of one tile. Its storage is one of three
//! encodings chosen for the shape of the data:
//!
//! - [`ArrayChunk`]: dense, one slot per cell
//! - [`MapChunk`]: a default value plus bitset / hash-set exceptions
//! - [`SingletChunk`]: a single value for the whole chunk
//!
//! All encodings answer `get_cell`, `n`, `sum`, `min` and `max` identically
//! for the same cell contents.

mod array;
mod bitset;
mod map;
mod singlet;

pub use array::ArrayChunk;
pub use bitset::OffsetBitSet;
pub use map::{MapChunk, ValueBits, ValueCells};
pub use singlet::SingletChunk;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem::size_of;

use crate::cell::CellValue;
use crate::error::{ChunkError, ChunkResult};
use crate::id::{chunk_cells, ChunkId};
use crate::iter::{Aspatial, RowMajor};
use crate::sum::ExactSum;

/// Which encoding a chunk uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Array,
    Map,
    Singlet,
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkKind::Array => write!(f, "array"),
            ChunkKind::Map => write!(f, "map"),
            ChunkKind::Singlet => write!(f, "singlet"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ChunkData<T: CellValue> {
    Array(ArrayChunk<T>),
    Map(MapChunk<T>),
    Singlet(SingletChunk<T>),
}

impl<T: CellValue> ChunkData<T> {
    pub fn kind(&self) -> ChunkKind {
        match self {
            ChunkData::Array(_) => ChunkKind::Array,
            ChunkData::Map(_) => ChunkKind::Map,
            ChunkData::Singlet(_) => ChunkKind::Singlet,
        }
    }

    fn heap_bytes(&self) -> usize {
        match self {
            ChunkData::Array(array) => array.heap_bytes(),
            ChunkData::Map(map) => map.heap_bytes(),
            ChunkData::Singlet(_) => 0,
        }
    }
}

/// Count, sum and extremes of the data cells (cells that are not no-data).
///
/// The sum is exact, so a summary built cell by cell equals one built from
/// value runs.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkSummary<T> {
    pub n: u64,
    pub sum: ExactSum,
    pub min: Option<T>,
    pub max: Option<T>,
}

impl<T: CellValue> ChunkSummary<T> {
    pub fn empty() -> Self {
        Self {
            n: 0,
            sum: ExactSum::new(),
            min: None,
            max: None,
        }
    }

    /// Account for `count` cells holding `value`.
    pub fn add_run(&mut self, value: T, count: u64, no_data: T) {
        if count == 0 || value.same(no_data) {
            return;
        }
        self.n += count;
        self.sum.add(value.exact(), count);
        self.include_extremes(value);
    }

    pub fn merge(&mut self, other: &ChunkSummary<T>) {
        self.n += other.n;
        self.sum.merge(&other.sum);
        if let Some(min) = other.min {
            self.include_extremes(min);
        }
        if let Some(max) = other.max {
            self.include_extremes(max);
        }
    }

    fn include_extremes(&mut self, value: T) {
        // NaN data has no place in an ordering.
        if value.partial_cmp(&value).is_none() {
            return;
        }
        if self.min.map_or(true, |min| value < min) {
            self.min = Some(value);
        }
        if self.max.map_or(true, |max| value > max) {
            self.max = Some(value);
        }
    }
}

impl<T: CellValue> Default for ChunkSummary<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// One tile of a grid.
#[derive(Clone, Debug)]
pub struct Chunk<T: CellValue> {
    id: ChunkId,
    rows: usize,
    cols: usize,
    no_data: T,
    /// Whether the persisted copy matches the in-memory cells.
    cache_up_to_date: bool,
    data: ChunkData<T>,
}

impl<T: CellValue> Chunk<T> {
    /// Wrap encoded storage. Array storage must hold `rows * cols` cells,
    /// and the extent may not exceed [`MAX_CHUNK_CELLS`](crate::id::MAX_CHUNK_CELLS).
    pub fn new(
        id: ChunkId,
        rows: usize,
        cols: usize,
        no_data: T,
        data: ChunkData<T>,
    ) -> ChunkResult<Self> {
        let cells = chunk_cells(rows, cols)?;
        if let ChunkData::Array(array) = &data {
            if array.len() != cells {
                return Err(ChunkError::InvalidShape(format!(
                    "{} cells stored for a {}x{} chunk",
                    array.len(),
                    rows,
                    cols
                )));
            }
        }
        Ok(Self {
            id,
            rows,
            cols,
            no_data,
            cache_up_to_date: false,
            data,
        })
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of cells in the chunk.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn no_data(&self) -> T {
        self.no_data
    }

    pub fn kind(&self) -> ChunkKind {
        self.data.kind()
    }

    pub fn data(&self) -> &ChunkData<T> {
        &self.data
    }

    pub fn is_cache_up_to_date(&self) -> bool {
        self.cache_up_to_date
    }

    pub fn set_cache_up_to_date(&mut self, up_to_date: bool) {
        self.cache_up_to_date = up_to_date;
    }

    /// Whether evicting this chunk frees enough memory to pay for the I/O.
    pub fn worth_clearing(&self) -> bool {
        !matches!(self.data, ChunkData::Singlet(_))
    }

    /// Approximate bytes held by this chunk, inline and on the heap.
    pub fn estimated_bytes(&self) -> usize {
        size_of::<Self>() + self.data.heap_bytes()
    }

    fn position(&self, row: usize, col: usize) -> ChunkResult<usize> {
        if row >= self.rows || col >= self.cols {
            return Err(ChunkError::OutOfBounds {
                row,
                col,
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(row * self.cols + col)
    }

    pub fn get_cell(&self, row: usize, col: usize) -> ChunkResult<T> {
        let position = self.position(row, col)?;
        Ok(self.cell_at(position))
    }

    /// Value at a row-major position. The position must be in bounds.
    pub(crate) fn cell_at(&self, position: usize) -> T {
        match &self.data {
            ChunkData::Array(array) => array.get(position),
            ChunkData::Map(map) => map.get(position),
            ChunkData::Singlet(singlet) => singlet.value(),
        }
    }

    /// Store `value`, returning the previous value.
    ///
    /// A change clears the cache-up-to-date flag. Singlet chunks accept
    /// only their own value.
    pub fn set_cell(&mut self, row: usize, col: usize, value: T) -> ChunkResult<T> {
        let position = self.position(row, col)?;
        let previous = match &mut self.data {
            ChunkData::Array(array) => array.set(position, value),
            ChunkData::Map(map) => map.set(position, value),
            ChunkData::Singlet(singlet) => {
                if !singlet.value().same(value) {
                    return Err(ChunkError::UnsupportedOperation {
                        kind: ChunkKind::Singlet,
                        operation: "set_cell",
                    });
                }
                singlet.value()
            }
        };
        if !previous.same(value) {
            self.cache_up_to_date = false;
        }
        Ok(previous)
    }

    /// Upper bound on the extra bytes `set_cell(row, col, value)` may
    /// allocate.
    pub fn growth_bytes(&self, value: T) -> usize {
        match &self.data {
            ChunkData::Map(map) => map.growth_bytes(value),
            ChunkData::Array(_) | ChunkData::Singlet(_) => 0,
        }
    }

    /// Count of cells that are not no-data.
    pub fn n(&self) -> u64 {
        self.summary().n
    }

    /// Sum of the data cells, rounded once to `f64`.
    pub fn sum(&self) -> f64 {
        self.summary().sum.to_f64()
    }

    pub fn min(&self) -> Option<T> {
        self.summary().min
    }

    pub fn max(&self) -> Option<T> {
        self.summary().max
    }

    /// Summary of the data cells. Array chunks summarise runs of equal
    /// neighbouring cells, Map and Singlet chunks their value runs.
    pub fn summary(&self) -> ChunkSummary<T> {
        let mut summary = ChunkSummary::empty();
        match &self.data {
            ChunkData::Array(array) => {
                let mut run: Option<(T, u64)> = None;
                for value in array.values().iter().copied() {
                    if let Some((current, count)) = &mut run {
                        if current.same(value) {
                            *count += 1;
                            continue;
                        }
                    }
                    if let Some((current, count)) = run.replace((value, 1)) {
                        summary.add_run(current, count, self.no_data);
                    }
                }
                if let Some((value, count)) = run {
                    summary.add_run(value, count, self.no_data);
                }
            }
            ChunkData::Map(_) | ChunkData::Singlet(_) => {
                for (value, count) in self.runs() {
                    summary.add_run(value, count as u64, self.no_data);
                }
            }
        }
        summary
    }

    /// Values grouped into `(value, count)` runs with no spatial order.
    pub fn runs(&self) -> Vec<(T, usize)> {
        match &self.data {
            ChunkData::Array(array) => array.values().iter().map(|value| (*value, 1)).collect(),
            ChunkData::Map(map) => map.runs(),
            ChunkData::Singlet(singlet) if self.len() > 0 => vec![(singlet.value(), self.len())],
            ChunkData::Singlet(_) => Vec::new(),
        }
    }

    /// Row-major iterator over the cells.
    pub fn iter(&self) -> RowMajor<&Self> {
        RowMajor::new(self)
    }

    /// Iterator grouped by value run, cheaper than [`Chunk::iter`] for
    /// sparse encodings.
    pub fn aspatial(&self) -> Aspatial<T> {
        Aspatial::new(self.runs())
    }

    /// Copy of all cells in row-major order.
    pub fn to_values(&self) -> ChunkResult<Vec<T>> {
        let mut values = Vec::new();
        values
            .try_reserve_exact(self.len())
            .map_err(|_| ChunkError::AllocationFailed {
                bytes: self.len().saturating_mul(size_of::<T>()),
            })?;
        values.extend(self.iter());
        Ok(values)
    }
}
