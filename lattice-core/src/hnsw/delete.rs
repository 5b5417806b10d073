use crate::hnsw::graph::{HnswGraph, element_on};
use crate::hnsw::tuple::{MAX_ROW_REFS, RowId, TupleLocation};
use anyhow::Result;
use tracing::debug;

impl HnswGraph {
    /// Tombstones the element at `location`.
    ///
    /// Sets the deleted flag and clears every row reference in one page
    /// group. The tuples stay in place: neighbors keep pointing at the
    /// element and searches traverse it, but it is never chosen as a
    /// candidate again and its slots become reusable by the allocator.
    ///
    /// Returns `false` if the element was already deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the location does not hold an element tuple.
    pub fn mark_deleted(&self, location: TupleLocation) -> Result<bool> {
        let mut group = self.store.begin_group();
        let handle = group.register(self.store.lock_exclusive(location.page)?)?;
        let mut tuple = element_on(group.page(handle), location)?;

        if tuple.deleted {
            group.abort();
            return Ok(false);
        }

        tuple.deleted = true;
        tuple.row_refs = [RowId::INVALID; MAX_ROW_REFS];
        group.page_mut(handle).overwrite_item(location.slot, &tuple.to_bytes())?;
        group.commit()?;

        debug!(%location, "marked element deleted");
        Ok(true)
    }
}
