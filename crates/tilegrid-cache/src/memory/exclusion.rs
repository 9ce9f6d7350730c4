use std::collections::{HashMap, HashSet};
use std::fmt;
use tilegrid_core::ChunkId;

/// Identity of a grid registered with a memory manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GridId(pub(crate) u64);

impl GridId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GridId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grid#{}", self.0)
    }
}

/// Chunks an in-progress operation forbids the manager from evicting.
///
/// Either single chunks or whole grids can be excluded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Exclusions {
    grids: HashSet<GridId>,
    chunks: HashMap<GridId, HashSet<ChunkId>>,
}

impl Exclusions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusions protecting one chunk.
    pub fn chunk(grid: GridId, id: ChunkId) -> Self {
        Self::new().with_chunk(grid, id)
    }

    pub fn with_chunk(mut self, grid: GridId, id: ChunkId) -> Self {
        self.add_chunk(grid, id);
        self
    }

    pub fn with_grid(mut self, grid: GridId) -> Self {
        self.add_grid(grid);
        self
    }

    pub fn add_chunk(&mut self, grid: GridId, id: ChunkId) {
        self.chunks.entry(grid).or_default().insert(id);
    }

    pub fn add_grid(&mut self, grid: GridId) {
        self.grids.insert(grid);
    }

    /// Add everything `other` excludes.
    pub fn extend(&mut self, other: &Exclusions) {
        self.grids.extend(other.grids.iter().copied());
        for (grid, ids) in &other.chunks {
            self.chunks.entry(*grid).or_default().extend(ids.iter().copied());
        }
    }

    pub fn excludes_grid(&self, grid: GridId) -> bool {
        self.grids.contains(&grid)
    }

    pub fn excludes(&self, grid: GridId, id: ChunkId) -> bool {
        self.excludes_grid(grid) || self.chunks.get(&grid).is_some_and(|ids| ids.contains(&id))
    }

    pub fn is_empty(&self) -> bool {
        self.grids.is_empty() && self.chunks.values().all(HashSet::is_empty)
    }
}
