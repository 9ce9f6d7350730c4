//! Building and re-encoding chunks.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cell::CellValue;
use crate::chunk::{ArrayChunk, Chunk, ChunkData, ChunkKind, MapChunk, SingletChunk};
use crate::error::{ChunkError, ChunkResult};
use crate::id::{chunk_cells, ChunkId};

/// Default number of cells a Map exception hash set may hold before it is
/// promoted to a bitset.
pub const DEFAULT_PROMOTION_THRESHOLD: usize = 64;

/// Default limit on distinct values for which the adaptive policy still
/// chooses a Map encoding.
pub const DEFAULT_MAX_MAP_VALUES: usize = 16;

/// How a factory picks an encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactoryPolicy {
    /// Always use this encoding.
    Fixed(ChunkKind),
    /// Pick from the observed value frequencies.
    Adaptive,
}

/// Creates chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFactory {
    pub policy: FactoryPolicy,
    /// Hash-set to bitset promotion threshold of Map chunks.
    pub promotion_threshold: usize,
    /// Most distinct values the adaptive policy accepts for a Map chunk.
    pub max_map_values: usize,
}

impl Default for ChunkFactory {
    fn default() -> Self {
        Self {
            policy: FactoryPolicy::Fixed(ChunkKind::Map),
            promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,
            max_map_values: DEFAULT_MAX_MAP_VALUES,
        }
    }
}

impl ChunkFactory {
    pub fn fixed(kind: ChunkKind) -> Self {
        Self {
            policy: FactoryPolicy::Fixed(kind),
            ..Self::default()
        }
    }

    pub fn adaptive() -> Self {
        Self {
            policy: FactoryPolicy::Adaptive,
            ..Self::default()
        }
    }

    pub fn with_promotion_threshold(mut self, threshold: usize) -> Self {
        self.promotion_threshold = threshold;
        self
    }

    pub fn with_max_map_values(mut self, max_values: usize) -> Self {
        self.max_map_values = max_values;
        self
    }

    /// Encoding for a chunk whose cells all start as the same value.
    ///
    /// The adaptive policy picks Map here so the new chunk stays writable.
    pub fn kind_for_fill(&self) -> ChunkKind {
        match self.policy {
            FactoryPolicy::Fixed(kind) => kind,
            FactoryPolicy::Adaptive => ChunkKind::Map,
        }
    }

    /// Upper bound on the heap bytes a filled chunk of `cells` cells needs.
    pub fn fill_bytes<T: CellValue>(&self, cells: usize) -> usize {
        match self.kind_for_fill() {
            ChunkKind::Array => cells.saturating_mul(std::mem::size_of::<T>()),
            ChunkKind::Map | ChunkKind::Singlet => 0,
        }
    }

    /// A `rows x cols` chunk with every cell set to `fill`.
    pub fn create<T: CellValue>(
        &self,
        id: ChunkId,
        rows: usize,
        cols: usize,
        no_data: T,
        fill: T,
    ) -> ChunkResult<Chunk<T>> {
        let cells = chunk_cells(rows, cols)?;
        let data = match self.kind_for_fill() {
            ChunkKind::Array => ChunkData::Array(ArrayChunk::filled(cells, fill)?),
            ChunkKind::Map => ChunkData::Map(MapChunk::new(cells, fill, self.promotion_threshold)),
            ChunkKind::Singlet => ChunkData::Singlet(SingletChunk::new(fill)),
        };
        Chunk::new(id, rows, cols, no_data, data)
    }

    /// Encoding the adaptive policy picks for row-major `values`.
    ///
    /// One distinct value gives Singlet. A value covering at least half the
    /// cells, with no more than `max_map_values` distinct values, gives Map.
    /// Anything else is Array.
    pub fn choose<T: CellValue>(&self, values: &[T]) -> ChunkKind {
        if let FactoryPolicy::Fixed(kind) = self.policy {
            return kind;
        }
        let mut counts: HashMap<T::Key, usize> = HashMap::new();
        for value in values {
            *counts.entry(value.key()).or_insert(0) += 1;
            if counts.len() > self.max_map_values {
                return ChunkKind::Array;
            }
        }
        let most = counts.values().copied().max().unwrap_or(0);
        if counts.len() <= 1 {
            ChunkKind::Singlet
        } else if most * 2 >= values.len() {
            ChunkKind::Map
        } else {
            ChunkKind::Array
        }
    }

    /// Encode row-major `values` with the encoding this factory chooses.
    pub fn build<T: CellValue>(
        &self,
        id: ChunkId,
        rows: usize,
        cols: usize,
        no_data: T,
        values: Vec<T>,
    ) -> ChunkResult<Chunk<T>> {
        let kind = self.choose(&values);
        self.build_as(kind, id, rows, cols, no_data, values)
    }

    /// Encode row-major `values` as `kind`.
    ///
    /// Singlet requires every value to be the same.
    pub fn build_as<T: CellValue>(
        &self,
        kind: ChunkKind,
        id: ChunkId,
        rows: usize,
        cols: usize,
        no_data: T,
        values: Vec<T>,
    ) -> ChunkResult<Chunk<T>> {
        if values.len() != chunk_cells(rows, cols)? {
            return Err(ChunkError::InvalidShape(format!(
                "{} values for a {}x{} chunk",
                values.len(),
                rows,
                cols
            )));
        }
        let data = match kind {
            ChunkKind::Array => ChunkData::Array(ArrayChunk::from_values(values)),
            ChunkKind::Map => match MapChunk::from_values(&values, self.promotion_threshold) {
                Some(map) => ChunkData::Map(map),
                None => ChunkData::Map(MapChunk::new(0, no_data, self.promotion_threshold)),
            },
            ChunkKind::Singlet => {
                let first = values.first().copied().unwrap_or(no_data);
                if values.iter().any(|value| !value.same(first)) {
                    return Err(ChunkError::UnsupportedOperation {
                        kind: ChunkKind::Singlet,
                        operation: "holding more than one distinct value",
                    });
                }
                ChunkData::Singlet(SingletChunk::new(first))
            }
        };
        Chunk::new(id, rows, cols, no_data, data)
    }

    /// Re-encode `chunk` as `kind`, keeping its cell values.
    ///
    /// The result is marked out of date with the persisted copy, whose
    /// recorded encoding no longer matches.
    pub fn convert<T: CellValue>(
        &self,
        chunk: &Chunk<T>,
        kind: ChunkKind,
    ) -> ChunkResult<Chunk<T>> {
        let values = chunk.to_values()?;
        let mut converted =
            self.build_as(kind, chunk.id(), chunk.rows(), chunk.cols(), chunk.no_data(), values)?;
        let unchanged = converted.kind() == chunk.kind() && chunk.is_cache_up_to_date();
        converted.set_cache_up_to_date(unchanged);
        Ok(converted)
    }

    /// Re-encode `chunk` with the encoding this factory chooses.
    pub fn optimise<T: CellValue>(&self, chunk: &Chunk<T>) -> ChunkResult<Chunk<T>> {
        let values = chunk.to_values()?;
        let kind = self.choose(&values);
        self.convert(chunk, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: ChunkId = ChunkId::new(0, 0);

    #[test]
    fn test_adaptive_choice() {
        let factory = ChunkFactory::adaptive().with_max_map_values(3);
        assert_eq!(factory.choose(&[1, 1, 1, 1]), ChunkKind::Singlet);
        assert_eq!(factory.choose(&[1, 1, 2, 3]), ChunkKind::Map);
        assert_eq!(factory.choose(&[1, 2, 3, 3, 4]), ChunkKind::Array);
        assert_eq!(factory.choose(&[1, 2, 3, 4, 4, 4]), ChunkKind::Array);
        assert_eq!(factory.choose(&[1, 2, 3, 3, 3]), ChunkKind::Map);
    }

    #[test]
    fn test_fixed_choice_ignores_values() {
        let factory = ChunkFactory::fixed(ChunkKind::Array);
        assert_eq!(factory.choose(&[1, 1, 1]), ChunkKind::Array);
    }

    #[test]
    fn test_create_filled() {
        for kind in [ChunkKind::Array, ChunkKind::Map, ChunkKind::Singlet] {
            let chunk = ChunkFactory::fixed(kind).create(ID, 3, 2, -1, 4).unwrap();
            assert_eq!(chunk.kind(), kind);
            assert_eq!(chunk.iter().collect::<Vec<_>>(), vec![4; 6]);
            assert_eq!(chunk.n(), 6);
        }
        let adaptive = ChunkFactory::adaptive().create(ID, 2, 2, -1, -1).unwrap();
        assert_eq!(adaptive.kind(), ChunkKind::Map);
        assert_eq!(adaptive.n(), 0);
    }

    #[test]
    fn test_convert_keeps_values() {
        let mut chunk = ChunkFactory::fixed(ChunkKind::Map).create(ID, 2, 2, 0, 0).unwrap();
        chunk.set_cell(1, 0, 9).unwrap();
        let factory = ChunkFactory::default();
        let array = factory.convert(&chunk, ChunkKind::Array).unwrap();
        assert_eq!(array.kind(), ChunkKind::Array);
        assert_eq!(array.iter().collect::<Vec<_>>(), vec![0, 0, 9, 0]);
        assert!(!array.is_cache_up_to_date());

        let err = factory.convert(&chunk, ChunkKind::Singlet).unwrap_err();
        assert!(matches!(err, ChunkError::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_singlet_made_writable() {
        let singlet = ChunkFactory::fixed(ChunkKind::Singlet).create(ID, 2, 2, 0, 3).unwrap();
        let mut map = ChunkFactory::default().convert(&singlet, ChunkKind::Map).unwrap();
        map.set_cell(0, 1, 8).unwrap();
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![3, 8, 3, 3]);
    }

    #[test]
    fn test_optimise() {
        let chunk = ChunkFactory::fixed(ChunkKind::Array).create(ID, 2, 2, 0, 7).unwrap();
        let optimised = ChunkFactory::adaptive().optimise(&chunk).unwrap();
        assert_eq!(optimised.kind(), ChunkKind::Singlet);
        assert_eq!(optimised.sum(), 28.0);
    }

    #[test]
    fn test_build_checks_shape() {
        let err = ChunkFactory::default().build(ID, 2, 2, 0, vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, ChunkError::InvalidShape(_)));
    }

    #[test]
    fn test_create_rejects_oversized_chunk() {
        let factory = ChunkFactory::fixed(ChunkKind::Map);
        let err = factory.create(ID, 1 << 16, 1 << 16, 0i32, 0).unwrap_err();
        assert!(matches!(err, ChunkError::InvalidShape(_)));
    }
}
