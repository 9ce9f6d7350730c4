//! On-disk chunk cache.
//!
//! Each grid owns a directory under the manager's cache root:
//!
//! ```text
//! <cache_dir>/<grid name>/grid.json          manifest
//! <cache_dir>/<grid name>/chunks/<r>_<c>.bin one record per chunk
//! ```
//!
//! Chunk records are bincode-encoded [`ChunkRecord`]s. Files are written to
//! a temporary sibling and renamed into place.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tilegrid_core::{CellValue, Chunk, ChunkFactory, ChunkId, ChunkKind, ChunkLayout, ChunkRecord};
use tracing::debug;

use crate::error::{GridError, GridResult};
use crate::grid::Dimensions;
use crate::stats::StatsPolicy;

pub(crate) const MANIFEST_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "grid.json";
const CHUNK_DIR: &str = "chunks";

/// Grid metadata written next to the chunk records.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub version: u32,
    pub name: String,
    pub cell_type: String,
    pub layout: ChunkLayout,
    /// No-data value as text, parsed back with the cell type's `FromStr`
    pub no_data: String,
    pub dimensions: Dimensions,
    pub stats_policy: StatsPolicy,
    pub factory: ChunkFactory,
    pub chunks: Vec<ManifestChunk>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ManifestChunk {
    pub id: ChunkId,
    pub kind: ChunkKind,
}

#[derive(Clone, Debug)]
pub(crate) struct ChunkStore {
    name: String,
    dir: PathBuf,
}

impl ChunkStore {
    /// Store for the grid `name`, which must be a single path component.
    pub fn new(cache_dir: &Path, name: &str) -> GridResult<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            dir: cache_dir.join(name),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn chunk_path(&self, id: ChunkId) -> PathBuf {
        self.dir.join(CHUNK_DIR).join(format!("{}_{}.bin", id.row, id.col))
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Size of the persisted record, used to estimate a reload.
    pub fn record_len(&self, id: ChunkId) -> GridResult<usize> {
        let path = self.chunk_path(id);
        fs::metadata(&path)
            .map(|meta| meta.len() as usize)
            .map_err(|err| self.not_found_or(id, path, err))
    }

    pub fn write_chunk<T: CellValue>(&self, chunk: &Chunk<T>) -> GridResult<()> {
        let bytes = bincode::serialize(&ChunkRecord::from_chunk(chunk))?;
        let path = self.chunk_path(chunk.id());
        write_atomic(&path, &bytes)?;
        debug!(grid = %self.name, chunk = %chunk.id(), bytes = bytes.len(), "chunk persisted");
        Ok(())
    }

    pub fn read_chunk<T: CellValue>(&self, id: ChunkId) -> GridResult<Chunk<T>> {
        let path = self.chunk_path(id);
        let bytes = fs::read(&path).map_err(|err| self.not_found_or(id, path, err))?;
        // The cell type leads the record; check it before decoding cells.
        let cell_type: String = bincode::deserialize(&bytes)?;
        if cell_type != T::TYPE_NAME {
            return Err(GridError::TypeMismatch {
                name: self.name.clone(),
                found: cell_type,
                expected: T::TYPE_NAME,
            });
        }
        let record: ChunkRecord<T> = bincode::deserialize(&bytes)?;
        if record.id != id {
            return Err(GridError::Corrupt(format!(
                "record for chunk {} found at the path of chunk {}",
                record.id, id
            )));
        }
        Ok(record.into_chunk()?)
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> GridResult<()> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.manifest_path(), &bytes)
    }

    pub fn read_manifest(&self) -> GridResult<Manifest> {
        let path = self.manifest_path();
        let bytes = fs::read(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => GridError::GridNotFound(self.name.clone()),
            _ => GridError::persistence(&path, err),
        })?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(GridError::Corrupt(format!(
                "manifest version {} is not supported",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    fn not_found_or(&self, id: ChunkId, path: PathBuf, err: io::Error) -> GridError {
        match err.kind() {
            io::ErrorKind::NotFound => GridError::ChunkNotFound {
                grid: self.name.clone(),
                id,
            },
            _ => GridError::persistence(path, err),
        }
    }
}

/// Grid names become directory names under the cache root.
fn validate_name(name: &str) -> GridResult<()> {
    let invalid = |reason: &str| {
        Err(GridError::InvalidGridName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if name.is_empty() {
        return invalid("name is empty");
    }
    if name == "." || name == ".." {
        return invalid("name is a relative directory");
    }
    if name.contains(['/', '\\']) {
        return invalid("name contains a path separator");
    }
    if name.contains('\0') {
        return invalid("name contains a NUL byte");
    }
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> GridResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| GridError::persistence(parent, err))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|err| GridError::persistence(&tmp, err))?;
    fs::rename(&tmp, path).map_err(|err| GridError::persistence(path, err))
}
