use std::iter::FusedIterator;
use std::rc::Rc;
use std::vec;
use tilegrid_core::{CellValue, Chunk, ChunkId, ChunkIter, IterOrder};

use super::Grid;
use crate::error::{GridError, GridResult};

/// Iterator over every cell of a grid.
///
/// Chunks are visited in row-major chunk order and loaded one at a time,
/// so evicted chunks are reloaded as the iteration reaches them. After each
/// value the memory manager is given a chance to free memory, with the
/// current chunk excluded. Iteration stops after the first error.
pub struct GridIter<T: CellValue> {
    grid: Grid<T>,
    order: IterOrder,
    ids: vec::IntoIter<ChunkId>,
    current: Option<(ChunkId, ChunkIter<Rc<Chunk<T>>, T>)>,
    failed: bool,
}

impl<T: CellValue> GridIter<T> {
    pub(crate) fn new(grid: Grid<T>, order: IterOrder) -> Self {
        let ids = grid.chunk_ids().into_iter();
        Self {
            grid,
            order,
            ids,
            current: None,
            failed: false,
        }
    }

    /// Chunk the last returned value came from.
    pub fn current_chunk(&self) -> Option<ChunkId> {
        self.current.as_ref().map(|(id, _)| *id)
    }

    fn fail(&mut self, err: GridError) -> Option<GridResult<T>> {
        self.failed = true;
        self.current = None;
        Some(Err(err))
    }
}

impl<T: CellValue> Iterator for GridIter<T> {
    type Item = GridResult<T>;

    fn next(&mut self) -> Option<GridResult<T>> {
        if self.failed {
            return None;
        }
        loop {
            if let Some((id, cells)) = &mut self.current {
                if let Some(value) = cells.next() {
                    let exclusions = self.grid.core.exclusions(*id);
                    if let Err(err) = self.grid.core.env.check_and_maybe_free_memory(&exclusions) {
                        return self.fail(err);
                    }
                    return Some(Ok(value));
                }
            }
            let id = self.ids.next()?;
            match self.grid.iter_chunk(id, self.order) {
                Ok(cells) => self.current = Some((id, cells)),
                Err(err) => return self.fail(err),
            }
        }
    }
}

impl<T: CellValue> FusedIterator for GridIter<T> {}
