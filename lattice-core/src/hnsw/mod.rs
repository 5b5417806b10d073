//! Paged HNSW graph: tuples, placement, write-back and insertion.

mod alloc;
mod delete;
mod duplicate;
mod graph;
mod insert;
mod meta;
mod neighbors;
mod search;
pub mod tuple;
mod writer;

pub use alloc::Placement;
pub use graph::HnswGraph;
pub use meta::Promotion;
pub use neighbors::SlotChoice;
pub use search::{GraphConstruction, LayerSearch};
pub use tuple::{ElementTuple, MAX_ROW_REFS, NeighborTuple, RowId, TupleLocation, layer_capacity};

use crate::distance::DistanceMetric;
use std::cmp::Ordering;

/// HNSW construction parameters
#[derive(Debug, Clone, Copy)]
pub struct HnswParams {
    /// Fan-out per layer above 0 (layer 0 keeps `2m`)
    pub m: usize,

    /// Beam width used while choosing neighbors
    pub ef_construction: usize,

    /// Distance function
    pub metric: DistanceMetric,

    /// Highest level an element may be assigned
    pub max_level: u8,
}

impl HnswParams {
    /// Neighbor slots per element at `layer`
    #[inline]
    #[must_use]
    pub const fn layer_capacity(&self, layer: usize) -> usize {
        layer_capacity(self.m, layer)
    }
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 64,
            metric: DistanceMetric::Euclidean,
            max_level: tuple::max_level(16),
        }
    }
}

/// A neighbor candidate and its distance to the element being inserted
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub location: TupleLocation,
    pub distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.location.cmp(&other.location))
    }
}

/// The graph's designated starting element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub location: TupleLocation,
    pub level: u8,
}

/// An element being inserted.
///
/// Lives only for the duration of one insertion: construction fills
/// `neighbors`, the writer assigns both locations, the neighbor updater
/// consumes the candidate lists.
#[derive(Debug, Clone)]
pub struct Element {
    /// Level assigned at creation
    pub level: u8,

    /// Stored vector (already normalized where the metric requires it)
    pub vector: Vec<f32>,

    /// Row reference carried by this insertion
    pub row: RowId,

    /// Element tuple location, set once written
    pub location: TupleLocation,

    /// Neighbor tuple location, set once written
    pub neighbor_location: TupleLocation,

    /// Chosen neighbors per layer, index `l` for layer `l`, closest first
    pub neighbors: Vec<Vec<Candidate>>,
}

impl Element {
    /// Creates an unplaced element with no neighbors yet
    #[must_use]
    pub fn new(level: u8, vector: Vec<f32>, row: RowId) -> Self {
        Self {
            level,
            vector,
            row,
            location: TupleLocation::INVALID,
            neighbor_location: TupleLocation::INVALID,
            neighbors: vec![Vec::new(); usize::from(level) + 1],
        }
    }

    /// Element and neighbor tuples as they will be first written
    #[must_use]
    pub fn to_tuples(&self, m: usize) -> (ElementTuple, NeighborTuple) {
        let element = ElementTuple::new(self.level, self.vector.clone(), self.row);
        let mut neighbors = NeighborTuple::empty(self.level, m);
        for (layer, candidates) in self.neighbors.iter().enumerate() {
            let locations: Vec<_> = candidates.iter().map(|c| c.location).collect();
            neighbors.set_layer(self.level, layer, m, &locations);
        }
        (element, neighbors)
    }
}

/// Why an insertion wrote nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No vector was supplied
    NullInput,
    /// The metric normalizes and the vector has no direction
    ZeroNorm,
}

/// Result of one insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new graph node was written at `location`
    Inserted { location: TupleLocation },
    /// The row was attached to the existing identical element at `location`
    Coalesced { location: TupleLocation },
    /// Nothing was written
    Skipped(SkipReason),
}

impl InsertOutcome {
    /// Element tuple location holding the row, if any
    #[must_use]
    pub fn location(&self) -> Option<TupleLocation> {
        match self {
            Self::Inserted { location } | Self::Coalesced { location } => Some(*location),
            Self::Skipped(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn test_candidate_ordering() {
        let near = Candidate { location: TupleLocation::new(1, 0), distance: 0.5 };
        let far = Candidate { location: TupleLocation::new(1, 1), distance: 1.0 };
        let tie = Candidate { location: TupleLocation::new(2, 0), distance: 0.5 };

        assert!(near < far);
        assert!(near < tie);
        assert_ne!(near, tie);
    }

    #[test]
    fn test_candidate_in_heap() {
        let mut heap = BinaryHeap::new();
        heap.push(Candidate { location: TupleLocation::new(1, 0), distance: 0.5 });
        heap.push(Candidate { location: TupleLocation::new(1, 1), distance: 1.0 });
        heap.push(Candidate { location: TupleLocation::new(1, 2), distance: 0.1 });

        // Max-heap: largest distance first
        assert_eq!(heap.pop().unwrap().location.slot, 1);
        assert_eq!(heap.pop().unwrap().location.slot, 0);
        assert_eq!(heap.pop().unwrap().location.slot, 2);
    }

    #[test]
    fn test_element_tuples_follow_candidates() {
        let mut element = Element::new(1, vec![1.0, 2.0], RowId(5));
        element.neighbors[1].push(Candidate { location: TupleLocation::new(3, 1), distance: 0.2 });
        element.neighbors[0].push(Candidate { location: TupleLocation::new(3, 1), distance: 0.2 });
        element.neighbors[0].push(Candidate { location: TupleLocation::new(4, 0), distance: 0.9 });

        let (etup, ntup) = element.to_tuples(2);
        assert_eq!(etup.row_refs[0], RowId(5));
        assert_eq!(ntup.slots.len(), 6);
        assert_eq!(ntup.layer(1, 1, 2).collect::<Vec<_>>(), vec![TupleLocation::new(3, 1)]);
        assert_eq!(ntup.layer(1, 0, 2).count(), 2);
    }

    #[test]
    fn test_outcome_location() {
        let at = TupleLocation::new(2, 3);
        assert_eq!(InsertOutcome::Inserted { location: at }.location(), Some(at));
        assert_eq!(InsertOutcome::Skipped(SkipReason::NullInput).location(), None);
    }
}
