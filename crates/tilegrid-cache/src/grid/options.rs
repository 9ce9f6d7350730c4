use serde::{Deserialize, Serialize};
use tilegrid_core::{CellValue, ChunkFactory, ExactSum, ExactValue};

use crate::stats::StatsPolicy;

/// Default chunk extent in rows and columns
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Spatial extent of a grid.
///
/// Coordinates are `f64`. Derived bounds are computed exactly and rounded
/// once, so `xmax` is the `f64` nearest to `xmin + cellsize * n_cols`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
    pub cellsize: f64,
}

impl Dimensions {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64, cellsize: f64) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
            cellsize,
        }
    }

    /// Extent of `n_rows x n_cols` square cells anchored at `(xmin, ymin)`.
    pub fn from_origin(xmin: f64, ymin: f64, cellsize: f64, n_rows: u64, n_cols: u64) -> Self {
        Self::new(
            xmin,
            ymin,
            offset(xmin, cellsize, n_cols),
            offset(ymin, cellsize, n_rows),
            cellsize,
        )
    }

    /// One unit per cell from the origin.
    pub fn unit(n_rows: u64, n_cols: u64) -> Self {
        Self::from_origin(0.0, 0.0, 1.0, n_rows, n_cols)
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }
}

/// `origin + cellsize * n`, rounded to `f64` once.
fn offset(origin: f64, cellsize: f64, n: u64) -> f64 {
    let mut sum = ExactSum::new();
    sum.add(ExactValue::from_f64(origin), 1);
    sum.add(ExactValue::from_f64(cellsize), n);
    sum.to_f64()
}

/// Parameters for creating a grid
#[derive(Clone, Debug)]
pub struct GridOptions<T> {
    /// Unique among live grids; also the cache directory name
    pub name: String,
    pub n_rows: u64,
    pub n_cols: u64,
    pub chunk_rows: usize,
    pub chunk_cols: usize,
    pub no_data: T,
    /// Value every cell starts with
    pub initial: T,
    /// Spatial extent, one unit per cell if unset
    pub dimensions: Option<Dimensions>,
    pub stats_policy: StatsPolicy,
    pub factory: ChunkFactory,
}

impl<T: CellValue> GridOptions<T> {
    /// Options for a grid whose cells all start as no-data.
    pub fn new(name: impl Into<String>, n_rows: u64, n_cols: u64, no_data: T) -> Self {
        Self {
            name: name.into(),
            n_rows,
            n_cols,
            chunk_rows: DEFAULT_CHUNK_SIZE,
            chunk_cols: DEFAULT_CHUNK_SIZE,
            no_data,
            initial: no_data,
            dimensions: None,
            stats_policy: StatsPolicy::default(),
            factory: ChunkFactory::default(),
        }
    }

    pub fn with_chunk_size(mut self, rows: usize, cols: usize) -> Self {
        self.chunk_rows = rows;
        self.chunk_cols = cols;
        self
    }

    pub fn with_initial_value(mut self, value: T) -> Self {
        self.initial = value;
        self
    }

    pub fn with_dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub fn with_stats_policy(mut self, policy: StatsPolicy) -> Self {
        self.stats_policy = policy;
        self
    }

    pub fn with_factory(mut self, factory: ChunkFactory) -> Self {
        self.factory = factory;
        self
    }
}
