//! Iterators over the cells of one chunk.
//!
//! [`RowMajor`] walks cells left to right, top to bottom. [`Aspatial`]
//! yields the same multiset of values grouped by value run (default run,
//! then each bitset, then each hash set for Map chunks) and makes no
//! promise about spatial order.

use std::ops::Deref;

use crate::cell::CellValue;
use crate::chunk::Chunk;

/// Order in which a chunk's cells are visited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IterOrder {
    #[default]
    RowMajor,
    Aspatial,
}

/// Row-major cell iterator.
///
/// Generic over how the chunk is held so grids can iterate a shared
/// handle while plain callers iterate a borrow.
#[derive(Clone, Debug)]
pub struct RowMajor<C> {
    chunk: C,
    next: usize,
    len: usize,
}

impl<T, C> RowMajor<C>
where
    T: CellValue,
    C: Deref<Target = Chunk<T>>,
{
    pub fn new(chunk: C) -> Self {
        let len = chunk.len();
        Self {
            chunk,
            next: 0,
            len,
        }
    }

    /// Whether another cell remains. Does not advance.
    pub fn has_next(&self) -> bool {
        self.next < self.len
    }

    /// Local `(row, col)` of the cell the next call to `next` returns.
    pub fn position(&self) -> Option<(usize, usize)> {
        self.has_next()
            .then(|| (self.next / self.chunk.cols(), self.next % self.chunk.cols()))
    }
}

impl<T, C> Iterator for RowMajor<C>
where
    T: CellValue,
    C: Deref<Target = Chunk<T>>,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if !self.has_next() {
            return None;
        }
        let value = self.chunk.cell_at(self.next);
        self.next += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.next;
        (remaining, Some(remaining))
    }
}

impl<T, C> ExactSizeIterator for RowMajor<C>
where
    T: CellValue,
    C: Deref<Target = Chunk<T>>,
{
}

/// Run-grouped cell iterator.
#[derive(Clone, Debug)]
pub struct Aspatial<T> {
    runs: Vec<(T, usize)>,
    run: usize,
    used: usize,
}

impl<T: CellValue> Aspatial<T> {
    pub fn new(runs: Vec<(T, usize)>) -> Self {
        let mut iter = Self {
            runs,
            run: 0,
            used: 0,
        };
        iter.skip_empty_runs();
        iter
    }

    pub fn has_next(&self) -> bool {
        self.run < self.runs.len()
    }

    fn skip_empty_runs(&mut self) {
        while self.run < self.runs.len() && self.used >= self.runs[self.run].1 {
            self.run += 1;
            self.used = 0;
        }
    }
}

impl<T: CellValue> Iterator for Aspatial<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let (value, _) = *self.runs.get(self.run)?;
        self.used += 1;
        self.skip_empty_runs();
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.runs[self.run.min(self.runs.len())..]
            .iter()
            .map(|(_, count)| *count)
            .sum::<usize>()
            - self.used;
        (remaining, Some(remaining))
    }
}

impl<T: CellValue> ExactSizeIterator for Aspatial<T> {}

/// Either iterator, picked per chunk.
#[derive(Clone, Debug)]
pub enum ChunkIter<C, T> {
    RowMajor(RowMajor<C>),
    Aspatial(Aspatial<T>),
}

impl<T, C> ChunkIter<C, T>
where
    T: CellValue,
    C: Deref<Target = Chunk<T>>,
{
    /// Build the iterator for `order`. Array chunks have no run grouping
    /// to exploit and always iterate row-major.
    pub fn new(chunk: C, order: IterOrder) -> Self {
        match (order, chunk.kind()) {
            (IterOrder::Aspatial, kind) if kind != crate::chunk::ChunkKind::Array => {
                ChunkIter::Aspatial(chunk.aspatial())
            }
            _ => ChunkIter::RowMajor(RowMajor::new(chunk)),
        }
    }

    pub fn has_next(&self) -> bool {
        match self {
            ChunkIter::RowMajor(iter) => iter.has_next(),
            ChunkIter::Aspatial(iter) => iter.has_next(),
        }
    }
}

impl<T, C> Iterator for ChunkIter<C, T>
where
    T: CellValue,
    C: Deref<Target = Chunk<T>>,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        match self {
            ChunkIter::RowMajor(iter) => iter.next(),
            ChunkIter::Aspatial(iter) => iter.next(),
        }
    }
}
