//! Chunked, memory-managed grids.
//!
//! A [`Grid`] splits `n_rows x n_cols` cells into chunks and keeps only a
//! working set of them in memory. The rest live in the grid's cache
//! directory and are reloaded the first time they are touched again.
//! Every operation that may allocate runs through [`MemoryManager::run`]
//! with the chunk it works on excluded from eviction.

mod iter;
mod options;

pub use iter::GridIter;
pub use options::{Dimensions, GridOptions, DEFAULT_CHUNK_SIZE};

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::mem::size_of;
use std::path::Path;
use std::rc::Rc;
use tilegrid_core::{
    CellValue, Chunk, ChunkError, ChunkFactory, ChunkId, ChunkIter, ChunkKind, ChunkLayout,
    ChunkSummary, ExactSum, FactoryPolicy, IterOrder,
};
use tracing::{debug, info};

use crate::error::{GridError, GridResult};
use crate::memory::{Candidate, Evictable, ExclusionGuard, Exclusions, GridId, MemoryManager};
use crate::stats::{RoundingMode, Stats, StatsPolicy};
use crate::store::{ChunkStore, Manifest, ManifestChunk, MANIFEST_VERSION};

/// One chunk position. `chunk` is `None` while the chunk is evicted.
#[derive(Debug)]
struct Slot<T: CellValue> {
    chunk: Option<Rc<Chunk<T>>>,
    kind: ChunkKind,
    /// Bytes charged to the memory manager for the resident chunk
    charged: usize,
    last_used: u64,
}

impl<T: CellValue> Slot<T> {
    fn evicted(kind: ChunkKind) -> Self {
        Self {
            chunk: None,
            kind,
            charged: 0,
            last_used: 0,
        }
    }
}

struct GridState<T: CellValue> {
    slots: BTreeMap<ChunkId, Slot<T>>,
    stats: Stats<T>,
}

struct GridCore<T: CellValue> {
    id: GridId,
    name: String,
    layout: ChunkLayout,
    no_data: T,
    dimensions: Dimensions,
    factory: ChunkFactory,
    store: ChunkStore,
    env: Rc<MemoryManager>,
    state: RefCell<GridState<T>>,
}

/// A raster grid of `T` cells.
///
/// Cloning a `Grid` yields another handle to the same cells.
pub struct Grid<T: CellValue> {
    core: Rc<GridCore<T>>,
}

impl<T: CellValue> Clone for Grid<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: CellValue> fmt::Debug for Grid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grid")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("layout", &self.core.layout)
            .field("no_data", &self.core.no_data)
            .finish()
    }
}

impl<T: CellValue> Grid<T> {
    /// Create a grid with every cell set to `options.initial`.
    ///
    /// All chunks are created up front; chunks created early may already
    /// be evicted to the cache by the time this returns.
    pub fn new(env: &Rc<MemoryManager>, options: GridOptions<T>) -> GridResult<Self> {
        let layout = ChunkLayout::new(
            options.n_rows,
            options.n_cols,
            options.chunk_rows,
            options.chunk_cols,
        )?;
        let cells = options.n_rows.saturating_mul(options.n_cols);
        let mut fill = ChunkSummary::empty();
        fill.add_run(options.initial, cells, options.no_data);
        let dimensions = options
            .dimensions
            .unwrap_or_else(|| Dimensions::unit(options.n_rows, options.n_cols));

        let grid = Self::register(
            env,
            options.name,
            layout,
            options.no_data,
            dimensions,
            options.factory,
            Stats::from_summary(options.stats_policy, fill),
        )?;
        for id in layout.ids() {
            grid.core.create_chunk(id, options.initial)?;
        }
        info!(
            grid = %grid.core.name,
            n_rows = layout.n_rows(),
            n_cols = layout.n_cols(),
            chunks = layout.n_chunks(),
            "grid created"
        );
        Ok(grid)
    }

    /// Reopen a grid previously saved with [`Grid::write_to_cache`].
    ///
    /// No chunk is loaded until it is touched. Statistics are recomputed on
    /// first use.
    pub fn open(env: &Rc<MemoryManager>, name: &str) -> GridResult<Self> {
        let manifest = ChunkStore::new(&env.config().cache_dir, name)?.read_manifest()?;
        if manifest.cell_type != T::TYPE_NAME {
            return Err(GridError::TypeMismatch {
                name: name.to_string(),
                found: manifest.cell_type,
                expected: T::TYPE_NAME,
            });
        }
        let no_data: T = manifest.no_data.parse().map_err(|_| {
            GridError::Corrupt(format!("unreadable no-data value {:?}", manifest.no_data))
        })?;
        let stored = manifest.layout;
        let layout = ChunkLayout::new(
            stored.n_rows(),
            stored.n_cols(),
            stored.chunk_rows(),
            stored.chunk_cols(),
        )?;
        let slots: BTreeMap<ChunkId, Slot<T>> = manifest
            .chunks
            .iter()
            .map(|entry| (entry.id, Slot::evicted(entry.kind)))
            .collect();
        let complete = slots.len() as u64 == layout.n_chunks()
            && layout.ids().all(|id| slots.contains_key(&id));
        if !complete {
            return Err(GridError::Corrupt(format!(
                "manifest of {} lists {} chunks for a layout of {}",
                name,
                slots.len(),
                layout.n_chunks()
            )));
        }

        let grid = Self::register(
            env,
            name.to_string(),
            layout,
            no_data,
            manifest.dimensions,
            manifest.factory,
            Stats::new(manifest.stats_policy),
        )?;
        grid.core.state.borrow_mut().slots = slots;
        info!(grid = name, chunks = layout.n_chunks(), "grid opened from cache");
        Ok(grid)
    }

    fn register(
        env: &Rc<MemoryManager>,
        name: String,
        layout: ChunkLayout,
        no_data: T,
        dimensions: Dimensions,
        factory: ChunkFactory,
        stats: Stats<T>,
    ) -> GridResult<Self> {
        let store = ChunkStore::new(&env.config().cache_dir, &name)?;
        let id = env.allocate_grid_id(&name)?;
        let core = Rc::new(GridCore {
            id,
            store,
            name,
            layout,
            no_data,
            dimensions,
            factory,
            env: Rc::clone(env),
            state: RefCell::new(GridState {
                slots: BTreeMap::new(),
                stats,
            }),
        });
        let handle: Rc<dyn Evictable> = core.clone();
        env.register(id, &core.name, Rc::downgrade(&handle));
        Ok(Self { core })
    }

    pub fn id(&self) -> GridId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.core.layout
    }

    pub fn n_rows(&self) -> u64 {
        self.core.layout.n_rows()
    }

    pub fn n_cols(&self) -> u64 {
        self.core.layout.n_cols()
    }

    /// Default number of rows per chunk
    pub fn chunk_rows(&self) -> usize {
        self.core.layout.chunk_rows()
    }

    /// Default number of columns per chunk
    pub fn chunk_cols(&self) -> usize {
        self.core.layout.chunk_cols()
    }

    pub fn n_chunk_rows(&self) -> u64 {
        self.core.layout.n_chunk_rows()
    }

    pub fn n_chunk_cols(&self) -> u64 {
        self.core.layout.n_chunk_cols()
    }

    pub fn no_data(&self) -> T {
        self.core.no_data
    }

    pub fn is_no_data(&self, value: T) -> bool {
        value.same(self.core.no_data)
    }

    pub fn dimensions(&self) -> Dimensions {
        self.core.dimensions
    }

    pub fn factory(&self) -> ChunkFactory {
        self.core.factory
    }

    pub fn stats_policy(&self) -> StatsPolicy {
        self.core.state.borrow().stats.policy()
    }

    pub fn manager(&self) -> &Rc<MemoryManager> {
        &self.core.env
    }

    /// Directory holding this grid's persisted chunks and manifest.
    pub fn cache_path(&self) -> &Path {
        self.core.store.dir()
    }

    /// Chunk and local position of a global cell.
    pub fn cell_id(&self, row: u64, col: u64) -> GridResult<(ChunkId, usize, usize)> {
        let layout = &self.core.layout;
        if !layout.contains(row, col) {
            return Err(GridError::OutOfBounds {
                row,
                col,
                n_rows: layout.n_rows(),
                n_cols: layout.n_cols(),
            });
        }
        let (local_row, local_col) = layout.to_local(row, col);
        Ok((layout.chunk_id(row, col), local_row, local_col))
    }

    /// Global position of a cell inside chunk `id`.
    pub fn global_coords(
        &self,
        id: ChunkId,
        local_row: usize,
        local_col: usize,
    ) -> GridResult<(u64, u64)> {
        let (rows, cols) = self.chunk_extent(id)?;
        if local_row >= rows || local_col >= cols {
            return Err(ChunkError::OutOfBounds {
                row: local_row,
                col: local_col,
                rows,
                cols,
            }
            .into());
        }
        Ok(self.core.layout.to_global(id, local_row, local_col))
    }

    /// Actual `(rows, cols)` of chunk `id`.
    pub fn chunk_extent(&self, id: ChunkId) -> GridResult<(usize, usize)> {
        self.core.check_chunk(id)?;
        Ok(self.core.layout.extent(id))
    }

    /// All chunk ids in row-major order.
    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.core.chunk_ids()
    }

    pub fn is_resident(&self, id: ChunkId) -> bool {
        self.core
            .state
            .borrow()
            .slots
            .get(&id)
            .is_some_and(|slot| slot.chunk.is_some())
    }

    pub fn resident_chunk_count(&self) -> usize {
        self.core
            .state
            .borrow()
            .slots
            .values()
            .filter(|slot| slot.chunk.is_some())
            .count()
    }

    /// Encoding of chunk `id`, resident or not.
    pub fn chunk_kind(&self, id: ChunkId) -> GridResult<ChunkKind> {
        self.core
            .state
            .borrow()
            .slots
            .get(&id)
            .map(|slot| slot.kind)
            .ok_or(GridError::ChunkOutOfBounds(id))
    }

    /// Chunk `id`, reloading it from the cache if it was evicted.
    ///
    /// A chunk is never evicted while a handle returned here is alive. The
    /// handle is a snapshot: a later write to the chunk copies it first.
    pub fn get_chunk(&self, id: ChunkId) -> GridResult<Rc<Chunk<T>>> {
        self.core.load(id)
    }

    pub fn get_cell(&self, row: u64, col: u64) -> GridResult<T> {
        let (id, local_row, local_col) = self.cell_id(row, col)?;
        let chunk = self.core.load(id)?;
        Ok(chunk.get_cell(local_row, local_col)?)
    }

    /// Store `value`, returning the previous value.
    pub fn set_cell(&self, row: u64, col: u64, value: T) -> GridResult<T> {
        let (id, local_row, local_col) = self.cell_id(row, col)?;
        self.core.update_cell(id, local_row, local_col, |_| value)
    }

    /// Add `delta` to a cell, returning the previous value. A no-data cell
    /// takes `delta` as its value.
    pub fn add_to_cell(&self, row: u64, col: u64, delta: T) -> GridResult<T> {
        let (id, local_row, local_col) = self.cell_id(row, col)?;
        let no_data = self.core.no_data;
        self.core.update_cell(id, local_row, local_col, |previous| {
            if previous.same(no_data) {
                delta
            } else {
                previous.plus(delta)
            }
        })
    }

    /// Re-encode chunk `id` as `kind`. This is how a Singlet chunk is made
    /// writable again.
    pub fn convert_chunk(&self, id: ChunkId, kind: ChunkKind) -> GridResult<()> {
        let factory = self.core.factory;
        self.core.check_chunk(id)?;
        self.core.reencode(id, |chunk| {
            if chunk.kind() == kind {
                return Ok(None);
            }
            Ok(Some(factory.convert(chunk, kind)?))
        })?;
        Ok(())
    }

    /// Re-encode every chunk with the encoding the adaptive policy picks
    /// for its contents. Returns how many chunks changed encoding.
    pub fn optimise_chunks(&self) -> GridResult<usize> {
        let factory = ChunkFactory {
            policy: FactoryPolicy::Adaptive,
            ..self.core.factory
        };
        let mut changed = 0;
        for id in self.core.chunk_ids() {
            let converted = self.core.reencode(id, |chunk| {
                let optimised = factory.optimise(chunk)?;
                Ok((optimised.kind() != chunk.kind()).then_some(optimised))
            })?;
            if converted {
                changed += 1;
            }
        }
        debug!(grid = %self.core.name, changed, "chunks optimised");
        Ok(changed)
    }

    /// Persist every resident chunk that is out of date, then the manifest.
    ///
    /// Afterwards every chunk is up to date with the cache and the grid can
    /// be reopened with [`Grid::open`].
    pub fn write_to_cache(&self) -> GridResult<()> {
        let core = &self.core;
        let mut written = 0;
        for id in core.chunk_ids() {
            let dirty = core
                .state
                .borrow()
                .slots
                .get(&id)
                .and_then(|slot| slot.chunk.clone())
                .filter(|chunk| !chunk.is_cache_up_to_date());
            let Some(chunk) = dirty else {
                continue;
            };
            core.store.write_chunk(&chunk)?;
            drop(chunk);
            if let Some(chunk) = core
                .state
                .borrow_mut()
                .slots
                .get_mut(&id)
                .and_then(|slot| slot.chunk.as_mut())
            {
                Rc::make_mut(chunk).set_cache_up_to_date(true);
            }
            written += 1;
        }
        core.store.write_manifest(&core.manifest())?;
        info!(grid = %core.name, written, "grid written to cache");
        Ok(())
    }

    /// Persist chunk `id` if needed and drop it from memory.
    ///
    /// Returns `false` if the chunk was not resident, is not worth
    /// clearing, or is held elsewhere.
    pub fn evict_chunk(&self, id: ChunkId) -> GridResult<bool> {
        self.core.check_chunk(id)?;
        Ok(self.core.evict(id)?.is_some())
    }

    /// Keep chunk `id` resident until the guard is dropped.
    pub fn exclude_chunk(&self, id: ChunkId) -> ExclusionGuard {
        self.core.env.exclude(self.core.exclusions(id))
    }

    /// Count of data cells.
    pub fn n(&self) -> GridResult<u64> {
        self.core.refresh_stats(false)?;
        Ok(self.core.state.borrow().stats.n())
    }

    /// Sum of data cells, rounded once to `f64`.
    pub fn sum(&self) -> GridResult<f64> {
        self.core.refresh_stats(false)?;
        Ok(self.core.state.borrow().stats.sum())
    }

    /// Sum of data cells without rounding.
    pub fn exact_sum(&self) -> GridResult<ExactSum> {
        self.core.refresh_stats(false)?;
        Ok(self.core.state.borrow().stats.exact_sum().clone())
    }

    /// Smallest data value. Without `force_update` a stale cached value
    /// may be returned instead of rescanning.
    pub fn min(&self, force_update: bool) -> GridResult<Option<T>> {
        if force_update {
            self.core.refresh_stats(true)?;
        }
        Ok(self.core.state.borrow().stats.min())
    }

    /// Largest data value; see [`Grid::min`].
    pub fn max(&self, force_update: bool) -> GridResult<Option<T>> {
        if force_update {
            self.core.refresh_stats(true)?;
        }
        Ok(self.core.state.borrow().stats.max())
    }

    /// `sum / n` rounded to `scale` decimal places, `None` without data.
    pub fn mean(&self, scale: u32, mode: RoundingMode) -> GridResult<Option<f64>> {
        self.core.refresh_stats(false)?;
        Ok(self.core.state.borrow().stats.mean(scale, mode))
    }

    /// Rescan the grid if any statistic is stale.
    pub fn update_stats(&self) -> GridResult<()> {
        self.core.refresh_stats(true)
    }

    /// Up-to-date copy of the statistics.
    pub fn stats(&self) -> GridResult<Stats<T>> {
        self.core.refresh_stats(true)?;
        Ok(self.core.state.borrow().stats.clone())
    }

    /// Every cell, chunk by chunk in row-major chunk order and row-major
    /// within each chunk.
    pub fn iter(&self) -> GridIter<T> {
        GridIter::new(self.clone(), IterOrder::RowMajor)
    }

    /// Every cell, chunk by chunk, grouping values by run inside sparse
    /// chunks.
    pub fn iter_aspatial(&self) -> GridIter<T> {
        GridIter::new(self.clone(), IterOrder::Aspatial)
    }

    /// Cells of one chunk.
    pub fn iter_chunk(
        &self,
        id: ChunkId,
        order: IterOrder,
    ) -> GridResult<ChunkIter<Rc<Chunk<T>>, T>> {
        let chunk = self.core.load(id)?;
        Ok(ChunkIter::new(chunk, order))
    }
}

impl<T: CellValue> GridCore<T> {
    fn exclusions(&self, id: ChunkId) -> Exclusions {
        Exclusions::chunk(self.id, id)
    }

    fn check_chunk(&self, id: ChunkId) -> GridResult<()> {
        if !self.layout.contains_chunk(id) {
            return Err(GridError::ChunkOutOfBounds(id));
        }
        Ok(())
    }

    fn chunk_ids(&self) -> Vec<ChunkId> {
        self.state.borrow().slots.keys().copied().collect()
    }

    /// Hold `estimate` bytes against the budget while `build` runs.
    fn charged<R>(
        &self,
        estimate: usize,
        build: impl FnOnce() -> GridResult<R>,
    ) -> GridResult<R> {
        self.env.try_charge(estimate)?;
        let result = build();
        self.env.release(estimate);
        result
    }

    fn create_chunk(&self, id: ChunkId, fill: T) -> GridResult<()> {
        let (rows, cols) = self.layout.extent(id);
        let estimate = size_of::<Chunk<T>>() + self.factory.fill_bytes::<T>(rows * cols);
        self.env.run(&self.exclusions(id), || {
            let chunk = self.charged(estimate, || {
                Ok(self.factory.create(id, rows, cols, self.no_data, fill)?)
            })?;
            self.install(id, chunk);
            Ok(())
        })
    }

    /// Put `chunk` in its slot and charge what it holds.
    fn install(&self, id: ChunkId, chunk: Chunk<T>) -> Rc<Chunk<T>> {
        let bytes = chunk.estimated_bytes();
        let kind = chunk.kind();
        let chunk = Rc::new(chunk);
        self.env.charge(bytes);

        let mut state = self.state.borrow_mut();
        let slot = state.slots.entry(id).or_insert_with(|| Slot::evicted(kind));
        self.env.release(slot.charged);
        slot.chunk = Some(Rc::clone(&chunk));
        slot.kind = kind;
        slot.charged = bytes;
        slot.last_used = self.env.tick();
        chunk
    }

    /// The resident chunk `id`, if any, marked as just used.
    fn resident(&self, id: ChunkId) -> GridResult<Option<Rc<Chunk<T>>>> {
        let mut state = self.state.borrow_mut();
        let slot = state
            .slots
            .get_mut(&id)
            .ok_or(GridError::ChunkOutOfBounds(id))?;
        if slot.chunk.is_some() {
            slot.last_used = self.env.tick();
        }
        Ok(slot.chunk.clone())
    }

    fn load(&self, id: ChunkId) -> GridResult<Rc<Chunk<T>>> {
        if let Some(chunk) = self.resident(id)? {
            return Ok(chunk);
        }
        self.env.run(&self.exclusions(id), || self.reload(id))
    }

    fn reload(&self, id: ChunkId) -> GridResult<Rc<Chunk<T>>> {
        if let Some(chunk) = self.resident(id)? {
            return Ok(chunk);
        }
        let estimate = size_of::<Chunk<T>>() + self.store.record_len(id)?;
        let chunk: Chunk<T> = self.charged(estimate, || self.store.read_chunk(id))?;
        let fits = (chunk.rows(), chunk.cols()) == self.layout.extent(id)
            && chunk.no_data().same(self.no_data);
        if !fits {
            return Err(GridError::Corrupt(format!(
                "cached chunk {} of {} does not match the grid layout",
                id, self.name
            )));
        }
        debug!(grid = %self.name, chunk = %id, kind = %chunk.kind(), "chunk reloaded");
        Ok(self.install(id, chunk))
    }

    fn update_cell(
        &self,
        id: ChunkId,
        row: usize,
        col: usize,
        update: impl Fn(T) -> T,
    ) -> GridResult<T> {
        self.env.run(&self.exclusions(id), || {
            let chunk = self.load(id)?;
            let previous = chunk.get_cell(row, col)?;
            let value = update(previous);
            if previous.same(value) {
                return Ok(previous);
            }
            let growth = chunk.growth_bytes(value);
            drop(chunk);
            self.charged(growth, || self.write_cell(id, row, col, value))
        })
    }

    fn write_cell(&self, id: ChunkId, row: usize, col: usize, value: T) -> GridResult<T> {
        let mut state = self.state.borrow_mut();
        let GridState { slots, stats } = &mut *state;
        let slot = slots.get_mut(&id).ok_or(GridError::ChunkOutOfBounds(id))?;
        let chunk = slot.chunk.as_mut().ok_or_else(|| GridError::ChunkNotFound {
            grid: self.name.clone(),
            id,
        })?;
        let chunk = Rc::make_mut(chunk);
        let previous = chunk.set_cell(row, col, value)?;
        let bytes = chunk.estimated_bytes();
        self.env.release(slot.charged);
        self.env.charge(bytes);
        slot.charged = bytes;
        slot.last_used = self.env.tick();
        stats.record_change(previous, value, self.no_data);
        Ok(previous)
    }

    /// Replace chunk `id` with what `reencode` builds from it, if anything.
    fn reencode(
        &self,
        id: ChunkId,
        reencode: impl Fn(&Chunk<T>) -> GridResult<Option<Chunk<T>>>,
    ) -> GridResult<bool> {
        self.env.run(&self.exclusions(id), || {
            let chunk = self.load(id)?;
            // Room for a row-major copy of the cells plus the new encoding.
            let estimate = size_of::<Chunk<T>>()
                + chunk.len().saturating_mul(size_of::<T>()).saturating_mul(2);
            let Some(replacement) = self.charged(estimate, || reencode(&chunk))? else {
                return Ok(false);
            };
            debug!(
                grid = %self.name,
                chunk = %id,
                from = %chunk.kind(),
                to = %replacement.kind(),
                "chunk re-encoded"
            );
            drop(chunk);
            self.install(id, replacement);
            Ok(true)
        })
    }

    fn refresh_stats(&self, extremes: bool) -> GridResult<()> {
        let stale = {
            let state = self.state.borrow();
            state.stats.needs_rescan() || (extremes && state.stats.extremes_need_rescan())
        };
        if stale {
            self.rescan()?;
        }
        Ok(())
    }

    /// Recompute statistics from per-chunk summaries.
    fn rescan(&self) -> GridResult<()> {
        let mut summary = ChunkSummary::empty();
        for id in self.chunk_ids() {
            summary.merge(&self.load(id)?.summary());
        }
        debug!(grid = %self.name, n = summary.n, "stats rescanned");
        self.state.borrow_mut().stats.apply(summary);
        Ok(())
    }

    fn manifest(&self) -> Manifest {
        let state = self.state.borrow();
        Manifest {
            version: MANIFEST_VERSION,
            name: self.name.clone(),
            cell_type: T::TYPE_NAME.to_string(),
            layout: self.layout,
            no_data: self.no_data.to_string(),
            dimensions: self.dimensions,
            stats_policy: state.stats.policy(),
            factory: self.factory,
            chunks: state
                .slots
                .iter()
                .map(|(id, slot)| ManifestChunk {
                    id: *id,
                    kind: slot.kind,
                })
                .collect(),
        }
    }
}

impl<T: CellValue> Evictable for GridCore<T> {
    fn collect_candidates(&self, exclusions: &Exclusions, out: &mut Vec<Candidate>) {
        let Ok(state) = self.state.try_borrow() else {
            return;
        };
        for (id, slot) in &state.slots {
            let Some(chunk) = &slot.chunk else {
                continue;
            };
            if chunk.worth_clearing()
                && Rc::strong_count(chunk) == 1
                && !exclusions.excludes(self.id, *id)
            {
                out.push(Candidate {
                    grid: self.id,
                    chunk: *id,
                    last_used: slot.last_used,
                });
            }
        }
    }

    fn evict(&self, id: ChunkId) -> GridResult<Option<usize>> {
        let Ok(mut state) = self.state.try_borrow_mut() else {
            return Ok(None);
        };
        let Some(slot) = state.slots.get_mut(&id) else {
            return Ok(None);
        };
        let Some(chunk) = slot.chunk.as_ref() else {
            return Ok(None);
        };
        if !chunk.worth_clearing() || Rc::strong_count(chunk) > 1 {
            return Ok(None);
        }
        if !chunk.is_cache_up_to_date() {
            self.store.write_chunk(chunk)?;
        }
        slot.chunk = None;
        let bytes = std::mem::take(&mut slot.charged);
        self.env.release(bytes);
        Ok(Some(bytes))
    }
}

impl<T: CellValue> Drop for GridCore<T> {
    fn drop(&mut self) {
        let charged = self.state.get_mut().slots.values().map(|slot| slot.charged).sum();
        self.env.deregister(self.id, charged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use tempfile::TempDir;

    const NO_DATA: i32 = -9999;

    fn manager() -> (TempDir, Rc<MemoryManager>) {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            MemoryManager::new(ManagerConfig::default().with_cache_dir(dir.path())).unwrap();
        (dir, manager)
    }

    fn small_grid(env: &Rc<MemoryManager>, name: &str, factory: ChunkFactory) -> Grid<i32> {
        Grid::new(
            env,
            GridOptions::new(name, 4, 4, NO_DATA)
                .with_chunk_size(2, 2)
                .with_factory(factory),
        )
        .unwrap()
    }

    #[test]
    fn test_example_scenario() {
        let (_dir, env) = manager();
        let grid = small_grid(&env, "example", ChunkFactory::default());
        grid.set_cell(0, 0, 5).unwrap();
        grid.set_cell(0, 1, 5).unwrap();
        grid.set_cell(3, 3, 7).unwrap();

        assert_eq!(grid.n().unwrap(), 3);
        assert_eq!(grid.sum().unwrap(), 17.0);
        assert_eq!(grid.min(true).unwrap(), Some(5));
        assert_eq!(grid.max(true).unwrap(), Some(7));

        let values: Vec<i32> = grid.iter().collect::<GridResult<_>>().unwrap();
        let mut expected = vec![NO_DATA; 16];
        expected[0] = 5;
        expected[1] = 5;
        expected[15] = 7;
        assert_eq!(values, expected);
    }

    #[test]
    fn test_out_of_bounds() {
        let (_dir, env) = manager();
        let grid = small_grid(&env, "bounds", ChunkFactory::default());
        assert!(matches!(
            grid.get_cell(4, 0),
            Err(GridError::OutOfBounds { row: 4, col: 0, .. })
        ));
        assert!(matches!(grid.set_cell(0, 4, 1), Err(GridError::OutOfBounds { .. })));
        assert!(matches!(
            grid.get_chunk(ChunkId::new(2, 0)),
            Err(GridError::ChunkOutOfBounds(_))
        ));
    }

    #[test]
    fn test_coordinates() {
        let (_dir, env) = manager();
        let grid: Grid<f64> = Grid::new(
            &env,
            GridOptions::new("coords", 5, 3, f64::NAN).with_chunk_size(2, 2),
        )
        .unwrap();
        assert_eq!(grid.n_chunk_rows(), 3);
        assert_eq!(grid.n_chunk_cols(), 2);
        assert_eq!(grid.cell_id(4, 2).unwrap(), (ChunkId::new(2, 1), 0, 0));
        assert_eq!(grid.chunk_extent(ChunkId::new(2, 1)).unwrap(), (1, 1));
        assert_eq!(grid.global_coords(ChunkId::new(1, 0), 1, 1).unwrap(), (3, 1));
        assert!(grid.global_coords(ChunkId::new(2, 1), 1, 0).is_err());
        assert_eq!(grid.dimensions(), Dimensions::unit(5, 3));
    }

    #[test]
    fn test_initial_value_counts_as_data() {
        let (_dir, env) = manager();
        let grid: Grid<i64> = Grid::new(
            &env,
            GridOptions::new("filled", 3, 3, 0)
                .with_chunk_size(2, 2)
                .with_initial_value(2)
                .with_stats_policy(StatsPolicy::NotUpdated),
        )
        .unwrap();
        assert_eq!(grid.n().unwrap(), 9);
        assert_eq!(grid.sum().unwrap(), 18.0);
        grid.set_cell(2, 2, 0).unwrap();
        assert_eq!(grid.n().unwrap(), 8);
        assert_eq!(grid.mean(1, RoundingMode::HalfUp).unwrap(), Some(2.0));
    }

    #[test]
    fn test_updated_sum_survives_cancellation() {
        let (_dir, env) = manager();
        let grid: Grid<f64> = Grid::new(
            &env,
            GridOptions::new("cancel", 4, 4, -9999.0).with_chunk_size(2, 2),
        )
        .unwrap();
        grid.set_cell(0, 0, 1e16).unwrap();
        grid.set_cell(0, 1, 1.0).unwrap();
        grid.set_cell(0, 0, -9999.0).unwrap();
        assert_eq!(grid.n().unwrap(), 1);
        assert_eq!(grid.sum().unwrap(), 1.0);

        let updated = grid.exact_sum().unwrap();
        grid.core.state.borrow_mut().stats.invalidate();
        grid.update_stats().unwrap();
        assert_eq!(grid.exact_sum().unwrap(), updated);
    }

    #[test]
    fn test_large_integer_sum_is_exact() {
        let (_dir, env) = manager();
        for factory in [
            ChunkFactory::fixed(ChunkKind::Array),
            ChunkFactory::fixed(ChunkKind::Map),
        ] {
            let grid: Grid<i64> = Grid::new(
                &env,
                GridOptions::new("wide", 2, 2, i64::MIN)
                    .with_chunk_size(2, 2)
                    .with_factory(factory),
            )
            .unwrap();
            grid.set_cell(0, 0, 1 << 53).unwrap();
            for (row, col) in [(0, 1), (1, 0), (1, 1)] {
                grid.set_cell(row, col, 1).unwrap();
            }
            let expected = num_bigint::BigInt::from((1i64 << 53) + 3);
            assert_eq!(grid.exact_sum().unwrap().to_integer(), Some(expected.clone()));
            grid.update_stats().unwrap();
            let chunk = grid.get_chunk(ChunkId::new(0, 0)).unwrap();
            assert_eq!(chunk.summary().sum.to_integer(), Some(expected));
            assert_eq!(grid.mean(0, RoundingMode::Floor).unwrap(), Some(2_251_799_813_685_248.0));
        }
    }

    #[test]
    fn test_add_to_cell() {
        let (_dir, env) = manager();
        let grid = small_grid(&env, "add", ChunkFactory::fixed(ChunkKind::Array));
        grid.add_to_cell(1, 1, 3).unwrap();
        grid.add_to_cell(1, 1, 4).unwrap();
        assert_eq!(grid.get_cell(1, 1).unwrap(), 7);
        assert_eq!(grid.sum().unwrap(), 7.0);
    }

    #[test]
    fn test_singlet_needs_conversion() {
        let (_dir, env) = manager();
        let grid = small_grid(&env, "singlet", ChunkFactory::fixed(ChunkKind::Singlet));
        let id = ChunkId::new(0, 0);
        assert_eq!(grid.set_cell(0, 0, NO_DATA).unwrap(), NO_DATA);
        assert!(matches!(
            grid.set_cell(0, 0, 1),
            Err(GridError::Chunk(ChunkError::UnsupportedOperation { .. }))
        ));
        assert_eq!(grid.n().unwrap(), 0);

        grid.convert_chunk(id, ChunkKind::Map).unwrap();
        assert_eq!(grid.chunk_kind(id).unwrap(), ChunkKind::Map);
        grid.set_cell(0, 0, 1).unwrap();
        assert_eq!(grid.get_cell(0, 0).unwrap(), 1);
        assert_eq!(grid.n().unwrap(), 1);
    }

    #[test]
    fn test_optimise_chunks() {
        let (_dir, env) = manager();
        let grid = small_grid(&env, "optimise", ChunkFactory::fixed(ChunkKind::Array));
        grid.set_cell(0, 0, 9).unwrap();
        let changed = grid.optimise_chunks().unwrap();
        assert_eq!(changed, 4);
        assert_eq!(grid.chunk_kind(ChunkId::new(0, 0)).unwrap(), ChunkKind::Map);
        assert_eq!(grid.chunk_kind(ChunkId::new(1, 1)).unwrap(), ChunkKind::Singlet);
        assert_eq!(grid.get_cell(0, 0).unwrap(), 9);
        assert_eq!(grid.optimise_chunks().unwrap(), 0);
    }

    #[test]
    fn test_dirty_flag_follows_eviction() {
        let (_dir, env) = manager();
        let grid = small_grid(&env, "dirty", ChunkFactory::default());
        let id = ChunkId::new(0, 1);
        grid.set_cell(0, 3, 4).unwrap();
        assert!(!grid.get_chunk(id).unwrap().is_cache_up_to_date());

        assert!(grid.evict_chunk(id).unwrap());
        assert!(!grid.is_resident(id));
        assert!(!grid.evict_chunk(id).unwrap());

        let reloaded = grid.get_chunk(id).unwrap();
        assert!(reloaded.is_cache_up_to_date());
        assert_eq!(reloaded.get_cell(0, 1).unwrap(), 4);
    }

    #[test]
    fn test_held_chunk_is_not_evicted() {
        let (_dir, env) = manager();
        let grid = small_grid(&env, "held", ChunkFactory::default());
        let id = ChunkId::new(1, 0);
        let held = grid.get_chunk(id).unwrap();
        assert!(!grid.evict_chunk(id).unwrap());
        drop(held);
        assert!(grid.evict_chunk(id).unwrap());
    }

    #[test]
    fn test_write_then_open() {
        let (_dir, env) = manager();
        {
            let grid = small_grid(&env, "saved", ChunkFactory::adaptive());
            grid.set_cell(2, 1, 12).unwrap();
            grid.set_cell(3, 0, -3).unwrap();
            grid.write_to_cache().unwrap();
            assert!(grid
                .chunk_ids()
                .iter()
                .all(|id| grid.get_chunk(*id).unwrap().is_cache_up_to_date()));
        }

        let grid: Grid<i32> = Grid::open(&env, "saved").unwrap();
        assert_eq!(grid.resident_chunk_count(), 0);
        assert_eq!(grid.factory(), ChunkFactory::adaptive());
        assert_eq!(grid.get_cell(2, 1).unwrap(), 12);
        assert_eq!(grid.n().unwrap(), 2);
        assert_eq!(grid.min(true).unwrap(), Some(-3));
    }

    #[test]
    fn test_open_checks_cell_type() {
        let (_dir, env) = manager();
        {
            let grid = small_grid(&env, "typed", ChunkFactory::default());
            grid.write_to_cache().unwrap();
        }
        assert!(matches!(
            Grid::<f64>::open(&env, "typed"),
            Err(GridError::TypeMismatch { .. })
        ));
        assert!(matches!(
            Grid::<i32>::open(&env, "missing"),
            Err(GridError::GridNotFound(_))
        ));
    }

    #[test]
    fn test_names_are_unique_while_alive() {
        let (_dir, env) = manager();
        let grid = small_grid(&env, "unique", ChunkFactory::default());
        let again = Grid::new(&env, GridOptions::new("unique", 1, 1, 0i32));
        assert!(matches!(again, Err(GridError::DuplicateGridName(_))));
        drop(grid);
        assert!(Grid::new(&env, GridOptions::new("unique", 1, 1, 0i32)).is_ok());
    }

    #[test]
    fn test_path_like_names_are_rejected() {
        let (dir, env) = manager();
        for name in ["../outside", "", "..", "nested/grid"] {
            let created = Grid::new(&env, GridOptions::new(name, 1, 1, 0i32));
            assert!(matches!(created, Err(GridError::InvalidGridName { .. })));
            let opened = Grid::<i32>::open(&env, name);
            assert!(matches!(opened, Err(GridError::InvalidGridName { .. })));
        }
        assert_eq!(env.grid_count(), 0);
        assert!(!dir.path().parent().unwrap().join("outside").exists());
    }

    #[test]
    fn test_drop_releases_memory() {
        let (_dir, env) = manager();
        let grid = small_grid(&env, "released", ChunkFactory::fixed(ChunkKind::Array));
        assert!(env.resident_bytes() > 0);
        assert_eq!(env.grid_count(), 1);
        drop(grid);
        assert_eq!(env.resident_bytes(), 0);
        assert_eq!(env.grid_count(), 0);
    }
}
