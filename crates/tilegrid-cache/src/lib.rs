pub mod config;
pub mod error;
pub mod grid;
pub mod memory;
pub mod stats;
mod store;

pub use config::{ConfigError, ManagerConfig};
pub use error::{GridError, GridResult};
pub use grid::{Dimensions, Grid, GridIter, GridOptions};
pub use memory::{Account, AccountDetail, ExclusionGuard, Exclusions, GridId, MemoryManager};
pub use stats::{RoundingMode, Stats, StatsPolicy};

pub use tilegrid_core::{
    CellValue, Chunk, ChunkFactory, ChunkId, ChunkIter, ChunkKind, ExactSum, IterOrder,
};
