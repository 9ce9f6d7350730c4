//! Serializable form of a chunk.
//!
//! A record is self-describing: it names its cell type and carries its
//! encoding as the payload variant, so the matching constructor can rebuild
//! the chunk without outside knowledge.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::cell::CellValue;
use crate::chunk::{
    ArrayChunk, Chunk, ChunkData, ChunkKind, MapChunk, OffsetBitSet, SingletChunk, ValueBits,
    ValueCells,
};
use crate::error::{ChunkError, ChunkResult};
use crate::id::{chunk_cells, ChunkId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRecord<T> {
    pub cell_type: String,
    pub id: ChunkId,
    pub rows: usize,
    pub cols: usize,
    pub no_data: T,
    pub payload: ChunkPayload<T>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ChunkPayload<T> {
    Array {
        cells: Vec<T>,
    },
    Map {
        default: T,
        promotion_threshold: usize,
        bitsets: Vec<BitsRecord<T>>,
        sets: Vec<CellsRecord<T>>,
    },
    Singlet {
        value: T,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BitsRecord<T> {
    pub value: T,
    pub offset: usize,
    pub len: usize,
    pub words: Vec<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CellsRecord<T> {
    pub value: T,
    pub cells: Vec<u32>,
}

impl<T> ChunkPayload<T> {
    pub fn kind(&self) -> ChunkKind {
        match self {
            ChunkPayload::Array { .. } => ChunkKind::Array,
            ChunkPayload::Map { .. } => ChunkKind::Map,
            ChunkPayload::Singlet { .. } => ChunkKind::Singlet,
        }
    }
}

impl<T: CellValue> ChunkRecord<T> {
    pub fn from_chunk(chunk: &Chunk<T>) -> Self {
        let payload = match chunk.data() {
            ChunkData::Array(array) => ChunkPayload::Array {
                cells: array.values().to_vec(),
            },
            ChunkData::Map(map) => ChunkPayload::Map {
                default: map.default_value(),
                promotion_threshold: map.promotion_threshold(),
                bitsets: map
                    .bitsets()
                    .map(|entry| {
                        let (offset, len, words) = entry.bits.to_parts();
                        BitsRecord {
                            value: entry.value,
                            offset,
                            len,
                            words,
                        }
                    })
                    .collect(),
                sets: map
                    .sets()
                    .map(|entry| {
                        let mut cells: Vec<u32> = entry.cells.iter().copied().collect();
                        cells.sort_unstable();
                        CellsRecord {
                            value: entry.value,
                            cells,
                        }
                    })
                    .collect(),
            },
            ChunkData::Singlet(singlet) => ChunkPayload::Singlet {
                value: singlet.value(),
            },
        };
        Self {
            cell_type: T::TYPE_NAME.to_string(),
            id: chunk.id(),
            rows: chunk.rows(),
            cols: chunk.cols(),
            no_data: chunk.no_data(),
            payload,
        }
    }

    /// Rebuild the chunk. A chunk read back from its record is up to date
    /// with it.
    pub fn into_chunk(self) -> ChunkResult<Chunk<T>> {
        if self.cell_type != T::TYPE_NAME {
            return Err(ChunkError::InvalidShape(format!(
                "record holds {} cells, expected {}",
                self.cell_type,
                T::TYPE_NAME
            )));
        }
        let cells = chunk_cells(self.rows, self.cols)?;
        let data = match self.payload {
            ChunkPayload::Array { cells } => ChunkData::Array(ArrayChunk::from_values(cells)),
            ChunkPayload::Map {
                default,
                promotion_threshold,
                bitsets,
                sets,
            } => ChunkData::Map(MapChunk::from_parts(
                cells,
                default,
                bitsets
                    .into_iter()
                    .map(|b| ValueBits {
                        value: b.value,
                        bits: OffsetBitSet::from_parts(b.offset, b.len, b.words),
                    })
                    .collect(),
                sets.into_iter()
                    .map(|s| ValueCells {
                        value: s.value,
                        cells: s.cells.into_iter().collect::<HashSet<u32>>(),
                    })
                    .collect(),
                promotion_threshold,
            )),
            ChunkPayload::Singlet { value } => ChunkData::Singlet(SingletChunk::new(value)),
        };
        let mut chunk = Chunk::new(self.id, self.rows, self.cols, self.no_data, data)?;
        chunk.set_cache_up_to_date(true);
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::ChunkFactory;

    #[test]
    fn test_map_record_keeps_both_exception_kinds() {
        let mut chunk = ChunkFactory::fixed(ChunkKind::Map)
            .with_promotion_threshold(2)
            .create(ChunkId::new(3, 4), 4, 4, f64::NAN, f64::NAN)
            .unwrap();
        for position in [0, 5, 9] {
            chunk.set_cell(position / 4, position % 4, 1.5).unwrap();
        }
        chunk.set_cell(3, 3, -2.0).unwrap();

        let record = ChunkRecord::from_chunk(&chunk);
        assert_eq!(record.payload.kind(), ChunkKind::Map);
        if let ChunkPayload::Map { bitsets, sets, .. } = &record.payload {
            assert_eq!(bitsets.len(), 1);
            assert_eq!(sets.len(), 1);
        }

        let restored = record.into_chunk().unwrap();
        assert!(restored.is_cache_up_to_date());
        assert_eq!(restored.id(), ChunkId::new(3, 4));
        assert_eq!(restored.n(), 4);
        assert_eq!(restored.get_cell(3, 3).unwrap(), -2.0);
        assert!(restored.get_cell(0, 1).unwrap().is_nan());
    }

    #[test]
    fn test_wrong_cell_type_rejected() {
        let chunk = ChunkFactory::default()
            .create(ChunkId::new(0, 0), 1, 1, 0i32, 0)
            .unwrap();
        let mut record = ChunkRecord::from_chunk(&chunk);
        record.cell_type = "f64".to_string();
        assert!(record.into_chunk().is_err());
    }
}
