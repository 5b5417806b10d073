use crate::hnsw::graph::{HnswGraph, element_on};
use crate::hnsw::tuple::{MAX_ROW_REFS, RowId, TupleLocation};
use anyhow::Result;
use tracing::{debug, trace};

impl HnswGraph {
    /// Attaches `row` to the existing element at `location`.
    ///
    /// Returns `false`, writing nothing, when the element has no row
    /// references left (it is being deleted) or all of them are taken.
    /// The caller then inserts a new element instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the location does not hold an element tuple.
    pub(crate) fn add_duplicate(&self, location: TupleLocation, row: RowId) -> Result<bool> {
        let mut group = self.store.begin_group();
        let handle = group.register(self.store.lock_exclusive(location.page)?)?;
        let mut tuple = element_on(group.page(handle), location)?;

        let slot = tuple.first_free_row_slot().unwrap_or(MAX_ROW_REFS);
        if slot == 0 || slot == MAX_ROW_REFS || tuple.deleted {
            group.abort();
            trace!(%location, slot, "duplicate list unavailable");
            return Ok(false);
        }

        tuple.row_refs[slot] = row;
        group.page_mut(handle).overwrite_item(location.slot, &tuple.to_bytes())?;
        group.commit()?;

        debug!(%location, references = slot + 1, "coalesced duplicate");
        Ok(true)
    }
}
