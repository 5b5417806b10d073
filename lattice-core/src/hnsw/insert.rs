//! Insertion sequencing.
//!
//! ```text
//! Start -> DuplicateCheck -> Coalesced
//!                         -> Allocate -> WriteElement -> UpdateNeighbors
//!                                     -> MaybePromoteEntryPoint -> Done
//! ```
//!
//! `MaybePromoteEntryPoint` may run construction and `UpdateNeighbors` one
//! more time when the element was built against an empty graph and a
//! concurrent writer installed the first entry point meanwhile.

use crate::hnsw::graph::HnswGraph;
use crate::hnsw::meta::Promotion;
use crate::hnsw::search::GraphConstruction;
use crate::hnsw::{Element, EntryPoint, InsertOutcome};
use anyhow::Result;
use tracing::debug;

/// Reconnection passes after a lost entry-point race
const MAX_PROMOTION_RETRIES: usize = 1;

impl HnswGraph {
    /// Inserts a prepared element.
    ///
    /// The element's vector must already match the graph's dimensions and be
    /// normalized if the metric requires it.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure. Lost races and full duplicate
    /// lists are handled internally.
    pub fn insert_element(
        &self,
        construction: &dyn GraphConstruction,
        mut element: Element,
    ) -> Result<InsertOutcome> {
        let entry = self.entry_point()?;

        if let Some(entry) = entry {
            element.neighbors =
                construction.search_entry_point(self, &element.vector, element.level, entry, None)?;

            let duplicate = construction.find_exact_duplicate(self, &element.vector, &element.neighbors)?;
            if let Some(existing) = duplicate {
                if self.add_duplicate(existing, element.row)? {
                    return Ok(InsertOutcome::Coalesced { location: existing });
                }
            }
        }

        self.write_new_element_pages(&mut element)?;
        self.update_neighbor_pages(&element)?;
        self.maybe_promote_entry_point(construction, &mut element, entry)?;

        Ok(InsertOutcome::Inserted { location: element.location })
    }

    /// Installs the element as entry point if it out-ranks `prior`, the
    /// entry point it was built against.
    fn maybe_promote_entry_point(
        &self,
        construction: &dyn GraphConstruction,
        element: &mut Element,
        mut prior: Option<EntryPoint>,
    ) -> Result<()> {
        let candidate = EntryPoint { location: element.location, level: element.level };

        for _ in 0..=MAX_PROMOTION_RETRIES {
            if prior.is_some_and(|p| element.level <= p.level) {
                break;
            }

            match self.promote_entry_point(candidate, prior)? {
                Promotion::Installed | Promotion::Superseded => break,
                Promotion::Raced(current) => {
                    debug!(
                        location = %element.location,
                        entry = %current.location,
                        "reconnecting against concurrent entry point"
                    );
                    let fresh = construction.search_entry_point(
                        self,
                        &element.vector,
                        element.level,
                        current,
                        Some(element.location),
                    )?;
                    self.supplement_own_neighbors(element, fresh)?;
                    self.update_neighbor_pages(element)?;
                    prior = Some(current);
                }
            }
        }

        Ok(())
    }
}
