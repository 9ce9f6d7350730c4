use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tilegrid_core::{ChunkError, ChunkId};

use crate::config::ConfigError;

/// Grid and memory manager error type
#[derive(Error, Debug)]
pub enum GridError {
    #[error("cell ({row}, {col}) is outside a {n_rows}x{n_cols} grid")]
    OutOfBounds {
        row: u64,
        col: u64,
        n_rows: u64,
        n_cols: u64,
    },

    #[error("chunk {0} is outside the grid")]
    ChunkOutOfBounds(ChunkId),

    #[error("chunk error: {0}")]
    Chunk(ChunkError),

    #[error("chunk {id} of grid {grid} was never created or persisted")]
    ChunkNotFound { grid: String, id: ChunkId },

    #[error("no cached grid named {0}")]
    GridNotFound(String),

    #[error("invalid grid name {name:?}: {reason}")]
    InvalidGridName { name: String, reason: String },

    #[error("a live grid named {0} already exists")]
    DuplicateGridName(String),

    /// An allocation would exceed the memory budget. Recovered by the
    /// manager's retry loop; callers only see it if they bypass that loop.
    #[error("{requested} bytes requested beyond the memory budget")]
    MemoryPressure { requested: usize },

    #[error("memory exhausted: {requested} bytes requested and nothing left to evict")]
    MemoryExhausted { requested: usize },

    #[error("chunk store I/O error at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("chunk record encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("cached grid {name} holds {found} cells, not {expected}")]
    TypeMismatch {
        name: String,
        found: String,
        expected: &'static str,
    },

    #[error("corrupt cache: {0}")]
    Corrupt(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl GridError {
    /// Whether freeing memory and retrying may let the operation succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GridError::MemoryPressure { .. })
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: io::Error) -> Self {
        GridError::Persistence {
            path: path.into(),
            source,
        }
    }
}

impl From<ChunkError> for GridError {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::AllocationFailed { bytes } => {
                GridError::MemoryPressure { requested: bytes }
            }
            other => GridError::Chunk(other),
        }
    }
}

pub type GridResult<T> = Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_failure_is_recoverable() {
        let err = GridError::from(ChunkError::AllocationFailed { bytes: 64 });
        assert!(err.is_recoverable());
        assert!(matches!(err, GridError::MemoryPressure { requested: 64 }));
    }

    #[test]
    fn test_other_chunk_errors_are_not() {
        let err = GridError::from(ChunkError::InvalidShape("bad".into()));
        assert!(!err.is_recoverable());
        assert!(!GridError::MemoryExhausted { requested: 1 }.is_recoverable());
    }
}
