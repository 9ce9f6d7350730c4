use std::mem::size_of;

use crate::cell::CellValue;
use crate::error::{ChunkError, ChunkResult};

/// Dense row-major storage, one slot per cell.
#[derive(Clone, Debug)]
pub struct ArrayChunk<T> {
    cells: Vec<T>,
}

impl<T: CellValue> ArrayChunk<T> {
    /// Allocate `len` cells set to `value`.
    ///
    /// Allocation failure is reported instead of aborting so callers can
    /// free memory and retry.
    pub fn filled(len: usize, value: T) -> ChunkResult<Self> {
        let mut cells = Vec::new();
        cells
            .try_reserve_exact(len)
            .map_err(|_| ChunkError::AllocationFailed {
                bytes: len.saturating_mul(size_of::<T>()),
            })?;
        cells.resize(len, value);
        Ok(Self { cells })
    }

    pub fn from_values(cells: Vec<T>) -> Self {
        Self { cells }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, position: usize) -> T {
        self.cells[position]
    }

    pub fn set(&mut self, position: usize, value: T) -> T {
        std::mem::replace(&mut self.cells[position], value)
    }

    pub fn values(&self) -> &[T] {
        &self.cells
    }

    pub fn heap_bytes(&self) -> usize {
        self.cells.capacity() * size_of::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filled_and_set() {
        let mut chunk = ArrayChunk::filled(6, -1i32).unwrap();
        assert_eq!(chunk.len(), 6);
        assert_eq!(chunk.set(2, 4), -1);
        assert_eq!(chunk.get(2), 4);
        assert_eq!(chunk.values(), &[-1, -1, 4, -1, -1, -1]);
        assert_eq!(chunk.heap_bytes(), 6 * 4);
    }

    #[test]
    fn test_oversized_allocation_is_an_error() {
        let result = ArrayChunk::filled(usize::MAX / 2, 0.0f64);
        assert!(matches!(result, Err(ChunkError::AllocationFailed { .. })));
    }
}
