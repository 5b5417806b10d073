//! Construction-time neighbor search.
//!
//! Insertion needs, for every layer of the new element, a short list of
//! close existing elements. [`GraphConstruction`] is the seam; the engine
//! only consumes its candidate lists. [`LayerSearch`] is the default: greedy
//! descent through the layers above the element, then a beam search of
//! width `ef_construction` on each remaining layer.
//!
//! Deleted elements are traversed, so the graph stays navigable through
//! tombstones, but they are never returned as candidates.

use crate::hnsw::graph::{HnswGraph, PageCache};
use crate::hnsw::tuple::TupleLocation;
use crate::hnsw::{Candidate, EntryPoint};
use anyhow::Result;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

/// Source of neighbor candidates for a new element
pub trait GraphConstruction: Send + Sync {
    /// Chooses neighbor candidates for `vector` on layers `0..=level`,
    /// searching from `entry_point`.
    ///
    /// Returns one list per layer, index `l` for layer `l`, closest first,
    /// each at most `layer_capacity(l)` long. `exclude` is never returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be read.
    fn search_entry_point(
        &self,
        graph: &HnswGraph,
        vector: &[f32],
        level: u8,
        entry_point: EntryPoint,
        exclude: Option<TupleLocation>,
    ) -> Result<Vec<Vec<Candidate>>>;

    /// Picks an existing element whose vector is identical to `vector`
    /// among the layer 0 `candidates`.
    ///
    /// # Errors
    ///
    /// Returns an error if a candidate cannot be read.
    fn find_exact_duplicate(
        &self,
        graph: &HnswGraph,
        vector: &[f32],
        candidates: &[Vec<Candidate>],
    ) -> Result<Option<TupleLocation>> {
        let Some(layer0) = candidates.first() else {
            return Ok(None);
        };

        for candidate in layer0 {
            let existing = graph.load_element(candidate.location)?;
            if !existing.deleted && bitwise_eq(&existing.vector, vector) {
                return Ok(Some(candidate.location));
            }
        }

        Ok(None)
    }
}

fn bitwise_eq(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}

/// Default HNSW construction search
#[derive(Debug, Clone, Copy)]
pub struct LayerSearch {
    /// Beam width on the element's own layers
    pub ef_construction: usize,
}

impl Default for LayerSearch {
    fn default() -> Self {
        Self { ef_construction: 64 }
    }
}

/// State of one construction search
struct Search<'g> {
    graph: &'g HnswGraph,
    query: &'g [f32],
    cache: PageCache,
    deleted: HashSet<TupleLocation>,
}

impl Search<'_> {
    fn score(&mut self, location: TupleLocation) -> Result<Candidate> {
        let element = self.cache.element(self.graph, location)?;
        if element.deleted {
            self.deleted.insert(location);
        }
        Ok(Candidate { location, distance: self.graph.distance(self.query, &element.vector) })
    }

    /// Beam search of width `ef` within one layer, closest first.
    ///
    /// Same shape as a query-time search: a min-heap of elements to expand
    /// and a max-heap of the best `ef` seen so far.
    fn search_layer(&mut self, entry: &[Candidate], ef: usize, layer: usize) -> Result<Vec<Candidate>> {
        let mut visited: HashSet<TupleLocation> = entry.iter().map(|c| c.location).collect();
        let mut candidates: BinaryHeap<Reverse<Candidate>> = entry.iter().copied().map(Reverse).collect();
        let mut results: BinaryHeap<Candidate> = entry.iter().copied().collect();

        while results.len() > ef {
            results.pop();
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if results.len() >= ef && results.peek().is_some_and(|w| current.distance > w.distance) {
                break;
            }

            let element = self.cache.element(self.graph, current.location)?;
            for neighbor in self.cache.neighbors(self.graph, &element, layer)? {
                if !visited.insert(neighbor) {
                    continue;
                }

                let scored = self.score(neighbor)?;
                let admit = results.len() < ef || results.peek().is_some_and(|w| scored.distance < w.distance);
                if admit {
                    candidates.push(Reverse(scored));
                    results.push(scored);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        Ok(results.into_sorted_vec())
    }
}

impl GraphConstruction for LayerSearch {
    fn search_entry_point(
        &self,
        graph: &HnswGraph,
        vector: &[f32],
        level: u8,
        entry_point: EntryPoint,
        exclude: Option<TupleLocation>,
    ) -> Result<Vec<Vec<Candidate>>> {
        let level = usize::from(level);
        let mut search = Search {
            graph,
            query: vector,
            cache: PageCache::default(),
            deleted: HashSet::new(),
        };

        let mut layers = vec![Vec::new(); level + 1];
        let mut nearest = vec![search.score(entry_point.location)?];

        for layer in (0..=usize::from(entry_point.level)).rev() {
            let capacity = graph.params.layer_capacity(layer);
            let ef = if layer > level { 1 } else { self.ef_construction.max(capacity) };

            nearest = search.search_layer(&nearest, ef, layer)?;

            if layer <= level {
                layers[layer] = nearest
                    .iter()
                    .filter(|c| Some(c.location) != exclude && !search.deleted.contains(&c.location))
                    .take(capacity)
                    .copied()
                    .collect();
            }
        }

        Ok(layers)
    }
}
