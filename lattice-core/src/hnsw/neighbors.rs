//! Back-link propagation into the neighbor tuples of chosen candidates.
//!
//! Candidates were picked during construction, without locks. Before each
//! write the candidate's tuples are reloaded and the new element is
//! re-qualified against what the candidate holds now; after locking, the
//! target slot is bounds-checked again. A candidate that no longer
//! qualifies is skipped, and a write that no longer fits is aborted.

use crate::hnsw::graph::{HnswGraph, PageCache, neighbor_tuple_on};
use crate::hnsw::tuple::{NeighborTuple, TupleLocation, layer_capacity};
use crate::hnsw::{Candidate, Element};
use anyhow::Result;
use std::collections::HashSet;
use tracing::{trace, warn};

/// Where the new element goes within a candidate's layer segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotChoice {
    /// Replace the entry at this offset within the segment
    Offset(usize),
    /// The segment has room; take its first empty slot
    AnyEmpty,
}

/// A reloaded candidate that still accepts the new element
#[derive(Debug, Clone, Copy)]
pub(crate) struct Connection {
    /// Candidate's neighbor tuple
    pub(crate) neighbor_location: TupleLocation,
    /// Candidate's level when reloaded
    pub(crate) level: u8,
    pub(crate) choice: SlotChoice,
}

impl HnswGraph {
    /// Adds `element` to the neighbor lists of its candidates, top layer first.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a corrupt tuple.
    pub(crate) fn update_neighbor_pages(&self, element: &Element) -> Result<()> {
        for layer in (0..=usize::from(element.level)).rev() {
            let Some(candidates) = element.neighbors.get(layer) else {
                continue;
            };

            for candidate in candidates {
                if candidate.location == element.location {
                    continue;
                }

                let Some(connection) = self.update_connection(element, candidate, layer)? else {
                    continue;
                };

                self.write_connection(element.location, candidate.location, connection, layer)?;
            }
        }

        Ok(())
    }

    /// Reloads `candidate` and decides whether, and where, `element`
    /// belongs among its neighbors at `layer`.
    ///
    /// Returns `None` when the candidate is gone, deleted, no longer reaches
    /// `layer`, already links to the element, or keeps only closer neighbors.
    pub(crate) fn update_connection(
        &self,
        element: &Element,
        candidate: &Candidate,
        layer: usize,
    ) -> Result<Option<Connection>> {
        let mut cache = PageCache::default();
        let target = cache.element(self, candidate.location)?;

        if target.deleted || usize::from(target.level) < layer {
            trace!(candidate = %candidate.location, layer, "candidate no longer qualifies");
            return Ok(None);
        }

        let tuple = cache.neighbor_tuple(self, target.neighbor_location)?;
        let range = NeighborTuple::layer_range(target.level, layer, self.params.m);
        let Some(segment) = tuple.slots.get(range) else {
            return Ok(None);
        };

        if segment.contains(&element.location) {
            return Ok(None);
        }

        let connection = |choice| Connection {
            neighbor_location: target.neighbor_location,
            level: target.level,
            choice,
        };

        let live = segment.iter().filter(|s| s.is_valid()).count();
        if live < layer_capacity(self.params.m, layer) {
            return Ok(Some(connection(SlotChoice::AnyEmpty)));
        }

        let new_distance = self.distance(&target.vector, &element.vector);

        // Deleted or unreadable entries are the first to go
        let mut farthest: Option<(usize, f32)> = None;
        for (offset, location) in segment.iter().enumerate() {
            let distance = match cache.element(self, *location) {
                Ok(existing) if !existing.deleted => self.distance(&target.vector, &existing.vector),
                _ => f32::INFINITY,
            };
            if farthest.is_none_or(|(_, worst)| distance > worst) {
                farthest = Some((offset, distance));
            }
        }

        Ok(match farthest {
            Some((offset, worst)) if new_distance < worst => {
                Some(connection(SlotChoice::Offset(offset)))
            }
            _ => None,
        })
    }

    /// Writes one back-link under the candidate's neighbor page lock.
    fn write_connection(
        &self,
        new_location: TupleLocation,
        candidate: TupleLocation,
        connection: Connection,
        layer: usize,
    ) -> Result<()> {
        let m = self.params.m;
        let neighbor_location = connection.neighbor_location;

        let mut group = self.store.begin_group();
        let handle = group.register(self.store.lock_exclusive(neighbor_location.page)?)?;
        let mut tuple = neighbor_tuple_on(group.page(handle), neighbor_location)?;

        let start = (usize::from(connection.level) - layer) * m;
        let index = match connection.choice {
            SlotChoice::Offset(offset) => Some(start + offset),
            SlotChoice::AnyEmpty => (start..start + layer_capacity(m, layer))
                .find(|&i| tuple.slots.get(i).is_some_and(|s| !s.is_valid())),
        };

        match index {
            Some(index) if index < tuple.slots.len() => {
                tuple.slots[index] = new_location;
                group.page_mut(handle).overwrite_item(neighbor_location.slot, &tuple.to_bytes())?;
                group.commit()?;
                trace!(%candidate, layer, index, "linked new element");
            }
            Some(index) => {
                group.abort();
                warn!(
                    %candidate,
                    layer,
                    index,
                    slots = tuple.slots.len(),
                    "neighbor slot out of bounds, skipping"
                );
            }
            None => {
                group.abort();
                trace!(%candidate, layer, "no empty slot left, skipping");
            }
        }

        Ok(())
    }

    /// Merges `fresh` candidates into the element's own neighbor tuple.
    ///
    /// Used after the element was first connected against a smaller graph.
    /// Entries already in the tuple, including back-links written by
    /// concurrent inserts, compete with the fresh candidates; each layer
    /// keeps its closest live entries. `element.neighbors` is replaced by
    /// the merged lists.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a corrupt tuple.
    pub(crate) fn supplement_own_neighbors(
        &self,
        element: &mut Element,
        fresh: Vec<Vec<Candidate>>,
    ) -> Result<()> {
        let m = self.params.m;
        let mut cache = PageCache::default();
        let mut group = self.store.begin_group();
        let handle = group.register(self.store.lock_exclusive(element.neighbor_location.page)?)?;
        let mut tuple = neighbor_tuple_on(group.page(handle), element.neighbor_location)?;

        for (layer, candidates) in fresh.into_iter().enumerate().take(usize::from(element.level) + 1) {
            let mut seen = HashSet::from([element.location]);
            let mut merged = Vec::new();

            let existing: Vec<_> = tuple.layer(element.level, layer, m).collect();
            for location in existing {
                if !seen.insert(location) {
                    continue;
                }
                match cache.element(self, location) {
                    Ok(other) if !other.deleted => merged.push(Candidate {
                        location,
                        distance: self.distance(&element.vector, &other.vector),
                    }),
                    _ => {}
                }
            }

            for candidate in candidates {
                if seen.insert(candidate.location) {
                    merged.push(candidate);
                }
            }

            merged.sort();
            merged.truncate(layer_capacity(m, layer));

            let locations: Vec<_> = merged.iter().map(|c| c.location).collect();
            tuple.set_layer(element.level, layer, m, &locations);
            element.neighbors[layer] = merged;
        }

        group.page_mut(handle).overwrite_item(element.neighbor_location.slot, &tuple.to_bytes())?;
        group.commit()?;
        trace!(location = %element.location, "supplemented own neighbors");
        Ok(())
    }
}
