use thiserror::Error;

use crate::chunk::ChunkKind;

/// Errors raised by chunk-level operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("cell ({row}, {col}) is outside a {rows}x{cols} chunk")]
    OutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("{kind} chunks do not support {operation}")]
    UnsupportedOperation {
        kind: ChunkKind,
        operation: &'static str,
    },

    #[error("failed to allocate {bytes} bytes of chunk storage")]
    AllocationFailed { bytes: usize },

    #[error("invalid chunk shape: {0}")]
    InvalidShape(String),
}

pub type ChunkResult<T> = Result<T, ChunkError>;
