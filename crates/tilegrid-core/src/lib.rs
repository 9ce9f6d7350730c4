pub mod cell;
pub mod chunk;
pub mod error;
pub mod factory;
pub mod id;
pub mod iter;
pub mod record;
pub mod sum;

pub use cell::CellValue;
pub use chunk::{
    ArrayChunk, Chunk, ChunkData, ChunkKind, ChunkSummary, MapChunk, OffsetBitSet, SingletChunk,
};
pub use error::{ChunkError, ChunkResult};
pub use factory::{ChunkFactory, FactoryPolicy};
pub use id::{ChunkId, ChunkLayout, MAX_CHUNK_CELLS};
pub use iter::{Aspatial, ChunkIter, IterOrder, RowMajor};
pub use record::{ChunkPayload, ChunkRecord};
pub use sum::{ExactSum, ExactValue};
