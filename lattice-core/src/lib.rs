//! Lattice - paged on-disk HNSW graph store
//!
//! Lattice keeps a Hierarchical Navigable Small World graph on fixed-size
//! pages of a single memory-mapped file and implements the insertion
//! write-back path: placing each new element on disk, linking it into its
//! neighbors' adjacency lists, coalescing exact duplicates and maintaining
//! the graph's entry point.
//!
//! # Features
//!
//! - Slotted 8KB pages, element and neighbor tuples addressed by page + slot
//! - Atomic multi-page commits; an aborted write leaves no trace
//! - Many concurrent writers, no global insertion lock
//! - Reuse of space left by deleted elements
//! - Explicit durability control via flush()
//!
//! # Example
//!
//! ```no_run
//! use lattice_core::{GraphIndex, IndexOptions, RowId};
//!
//! # fn main() -> anyhow::Result<()> {
//! let index = GraphIndex::open("embeddings.lattice", 768, IndexOptions::default())?;
//!
//! let embedding = vec![0.1; 768];
//! let outcome = index.insert(Some(&embedding), RowId(42))?;
//! println!("stored at {:?}", outcome.location());
//!
//! index.flush()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Scope
//!
//! Lattice is the storage and write-back half of an HNSW index. It does not
//! answer queries, vacuum, or log changes for crash replay; those belong to
//! the layer embedding it.

pub mod distance;

#[cfg(feature = "internals")]
pub mod header;
#[cfg(not(feature = "internals"))]
pub(crate) mod header;

#[cfg(feature = "internals")]
pub mod hnsw;
#[cfg(not(feature = "internals"))]
pub(crate) mod hnsw;

#[cfg(feature = "internals")]
pub mod page;
#[cfg(not(feature = "internals"))]
pub(crate) mod page;

#[cfg(feature = "internals")]
pub mod storage;
#[cfg(not(feature = "internals"))]
pub(crate) mod storage;

pub use distance::{DistanceMetric, cosine_distance, euclidean_distance};
pub use header::{MAGIC, MAX_DIMENSIONS, VERSION};
pub use hnsw::{
    Candidate, Element, ElementTuple, EntryPoint, GraphConstruction, HnswGraph, HnswParams,
    InsertOutcome, LayerSearch, MAX_ROW_REFS, RowId, SkipReason, TupleLocation,
};

use crate::header::Header;
use crate::page::{FIRST_DATA_PAGE, PAGE_SIZE};
use crate::storage::PageStore;
use anyhow::Result;
use std::path::Path;
use tracing::debug;

/// Configuration options for GraphIndex
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Fan-out per layer above 0 (M parameter); layer 0 keeps `2 * m`
    pub m: u16,

    /// Construction quality parameter (efConstruction)
    pub ef_construction: usize,

    /// Distance metric, fixed when the file is created
    pub metric: DistanceMetric,

    /// Highest level an element may be assigned.
    /// Defaults to the highest level whose neighbor tuple fits on a page.
    pub max_level: Option<u8>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self { m: 16, ef_construction: 64, metric: DistanceMetric::Euclidean, max_level: None }
    }
}

/// Public facade for a Lattice graph file
///
/// Owns the graph and the construction search used to pick neighbors.
/// All methods take `&self`; share the index between writer threads by
/// reference or `Arc`.
pub struct GraphIndex {
    /// Paged graph (owns the storage)
    graph: HnswGraph,

    /// Neighbor candidate source
    construction: Box<dyn GraphConstruction>,

    /// Layer multiplier cache: 1.0 / ln(M)
    ml: f64,
}

impl std::fmt::Debug for GraphIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphIndex").field("graph", &self.graph).field("ml", &self.ml).finish()
    }
}

impl GraphIndex {
    /// Open or create a graph file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the graph file
    /// * `dims` - Number of dimensions per vector
    /// * `options` - Graph configuration options
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The options are out of range
    /// - The file cannot be opened or created, or is locked by another process
    /// - The file is corrupted
    /// - The file was created with different dimensions, `m` or metric
    pub fn open<P: AsRef<Path>>(path: P, dims: u32, options: IndexOptions) -> Result<Self> {
        if options.m < 2 {
            anyhow::bail!("m must be at least 2, got {}", options.m);
        }
        let fan_out_cap = hnsw::tuple::max_fan_out();
        if usize::from(options.m) > fan_out_cap {
            anyhow::bail!("m must be at most {} to fit a page, got {}", fan_out_cap, options.m);
        }
        if dims == 0 || dims > MAX_DIMENSIONS {
            anyhow::bail!("Dimensions must be between 1 and {}, got {}", MAX_DIMENSIONS, dims);
        }

        let m = usize::from(options.m);
        let level_cap = hnsw::tuple::max_level(m);
        let max_level = match options.max_level {
            Some(level) if level > level_cap => {
                anyhow::bail!("max_level {} exceeds {} for m = {}", level, level_cap, m)
            }
            Some(level) => level,
            None => level_cap,
        };

        let template = Header::new(dims, options.m, options.metric.tag(), PAGE_SIZE as u32, FIRST_DATA_PAGE);
        let store = PageStore::open(path, &template)?;

        let params = HnswParams {
            m,
            ef_construction: options.ef_construction,
            metric: options.metric,
            max_level,
        };
        let graph = HnswGraph::open(store, params)?;

        Ok(Self {
            graph,
            construction: Box::new(LayerSearch { ef_construction: options.ef_construction }),
            ml: 1.0 / f64::from(options.m).ln(),
        })
    }

    /// Replaces the construction search
    #[must_use]
    pub fn with_construction(mut self, construction: impl GraphConstruction + 'static) -> Self {
        self.construction = Box::new(construction);
        self
    }

    /// Insert a vector for `row`
    ///
    /// A `None` vector is skipped. Under the cosine metric the vector is
    /// normalized first, and a zero vector is skipped. A vector identical to
    /// an existing live element is attached to that element while its
    /// row reference list has room.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Vector dimensions don't match the graph
    /// - The vector contains NaN or infinite values
    /// - A storage write fails
    pub fn insert(&self, vector: Option<&[f32]>, row: RowId) -> Result<InsertOutcome> {
        let level = self.sample_level();
        self.insert_at_level(vector, row, level)
    }

    /// Insert a vector for `row` with a fixed level instead of a sampled one
    ///
    /// # Errors
    ///
    /// Same as [`GraphIndex::insert`], plus an error if `level` exceeds the
    /// configured maximum.
    pub fn insert_at_level(&self, vector: Option<&[f32]>, row: RowId, level: u8) -> Result<InsertOutcome> {
        let Some(vector) = vector else {
            return Ok(InsertOutcome::Skipped(SkipReason::NullInput));
        };

        if level > self.graph.params().max_level {
            anyhow::bail!("Level {} exceeds max level {}", level, self.graph.params().max_level);
        }

        let dims = self.graph.dimensions();
        if vector.len() != dims {
            anyhow::bail!("Vector dimension mismatch: expected {}, got {}", dims, vector.len());
        }
        if vector.iter().any(|x| !x.is_finite()) {
            anyhow::bail!("Vector contains non-finite values");
        }

        let vector = if self.graph.params().metric.normalizes() {
            match distance::normalize(vector) {
                Some(unit) => unit,
                None => return Ok(InsertOutcome::Skipped(SkipReason::ZeroNorm)),
            }
        } else {
            vector.to_vec()
        };

        let outcome = self.graph.insert_element(self.construction.as_ref(), Element::new(level, vector, row))?;
        debug!(row = row.0, level, ?outcome, "insert finished");
        Ok(outcome)
    }

    /// Tombstone the element at `location`
    ///
    /// Returns `false` if it was already deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if `location` does not hold an element.
    pub fn mark_deleted(&self, location: TupleLocation) -> Result<bool> {
        self.graph.mark_deleted(location)
    }

    /// Read the element tuple at `location`
    ///
    /// # Errors
    ///
    /// Returns an error if `location` does not hold an element.
    pub fn element(&self, location: TupleLocation) -> Result<ElementTuple> {
        self.graph.load_element(location)
    }

    /// Current entry point
    ///
    /// # Errors
    ///
    /// Returns an error if the meta page cannot be read.
    pub fn entry_point(&self) -> Result<Option<EntryPoint>> {
        self.graph.entry_point()
    }

    /// Flush all committed pages to disk
    ///
    /// # Performance Warning
    ///
    /// This operation is expensive (1-50ms depending on storage device).
    /// Batch multiple insert() calls and flush() once at the end.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails
    pub fn flush(&self) -> Result<()> {
        self.graph.store().flush()
    }

    /// Get the dimensionality of vectors in this graph
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.graph.dimensions()
    }

    /// The underlying paged graph
    #[must_use]
    pub fn graph(&self) -> &HnswGraph {
        &self.graph
    }

    /// Select a level for a new element using exponential decay
    fn sample_level(&self) -> u8 {
        let uniform: f64 = rand::random();
        let level = (-(1.0 - uniform).ln() * self.ml).floor();
        level.min(f64::from(self.graph.params().max_level)) as u8
    }
}
