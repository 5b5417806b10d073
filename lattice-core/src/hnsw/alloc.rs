//! Placement of a new element and neighbor tuple pair.
//!
//! Starting at the insert cursor and following the page chain, each page is
//! tried in this order:
//!
//! 1. Both tuples fit: use this page for both.
//! 2. The element fits and this is the tail: append one page for the
//!    neighbor tuple.
//! 3. A deleted element on this page can be overwritten, and its neighbor
//!    tuple's page can take the new neighbor tuple in place of the old one.
//! 4. Move to the next page, or at the tail append a page (two if the pair
//!    does not fit on one) and place the element there.
//!
//! The returned [`Placement`] holds every page involved, locked and
//! registered in one [`AtomicGroup`].

use crate::hnsw::EntryPoint;
use crate::hnsw::graph::HnswGraph;
use crate::hnsw::tuple::{ElementTuple, TupleKind, TupleLocation};
use crate::page::{INVALID_PAGE, ITEM_ID_SIZE, Page, PageId, SlotId};
use crate::storage::{AtomicGroup, PageHandle};
use anyhow::Result;
use tracing::{debug, trace};

/// Slots of a deleted element whose tuples will be overwritten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reuse {
    pub(crate) element_slot: SlotId,
    pub(crate) neighbor_slot: SlotId,
}

/// Pages chosen for one element, locked and registered in an open group
#[derive(Debug)]
pub struct Placement<'s> {
    pub(crate) group: AtomicGroup<'s>,
    pub(crate) element_page: PageHandle,
    pub(crate) neighbor_page: PageHandle,
    pub(crate) reuse: Option<Reuse>,
    /// Neighbor page of the first tombstone seen during the scan
    pub(crate) first_free_page: Option<PageId>,
    /// Insert cursor when the scan started
    pub(crate) original_insert_page: PageId,
}

impl Placement<'_> {
    /// Page that will hold the element tuple
    #[must_use]
    pub fn element_page(&self) -> PageId {
        self.group.page_id(self.element_page)
    }

    /// Page that will hold the neighbor tuple
    #[must_use]
    pub fn neighbor_page(&self) -> PageId {
        self.group.page_id(self.neighbor_page)
    }

    /// Element and neighbor slots of the tombstone being reused, if any
    #[must_use]
    pub fn reused_slots(&self) -> Option<(SlotId, SlotId)> {
        self.reuse.map(|r| (r.element_slot, r.neighbor_slot))
    }

    /// Releases every page without writing anything
    pub fn abort(self) {
        self.group.abort();
    }
}

impl HnswGraph {
    /// Finds room for an element tuple of `element_size` bytes and a
    /// neighbor tuple of `neighbor_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure. Space for a tuple pair always
    /// exists eventually because the chain can grow.
    pub fn allocate(&self, element_size: usize, neighbor_size: usize) -> Result<Placement<'_>> {
        let combined = element_size + neighbor_size + ITEM_ID_SIZE;
        let original_insert_page = self.insert_page()?;
        let entry = self.entry_point()?;
        let mut first_free_page = None;
        let mut current = original_insert_page;

        loop {
            let mut group = self.store.begin_group();
            let handle = group.register(self.store.lock_exclusive(current)?)?;
            let free = group.page(handle).free_space();
            let next = group.page(handle).next_page();

            if free >= combined {
                trace!(page = current, "tuple pair fits on one page");
                return Ok(Placement {
                    group,
                    element_page: handle,
                    neighbor_page: handle,
                    reuse: None,
                    first_free_page,
                    original_insert_page,
                });
            }

            if free >= element_size && next == INVALID_PAGE {
                let neighbor_page = group.append_page()?;
                let new_id = group.page_id(neighbor_page);
                group.page_mut(handle).set_next_page(new_id);
                debug!(page = current, neighbor_page = new_id, "element on tail, neighbors on new page");
                return Ok(Placement {
                    group,
                    element_page: handle,
                    neighbor_page,
                    reuse: None,
                    first_free_page,
                    original_insert_page,
                });
            }

            if let Some((neighbor_page, reuse)) = self.find_free_slot(
                &mut group,
                handle,
                element_size,
                neighbor_size,
                entry,
                &mut first_free_page,
            )? {
                debug!(
                    page = current,
                    element_slot = reuse.element_slot,
                    neighbor_slot = reuse.neighbor_slot,
                    "reusing deleted element"
                );
                return Ok(Placement {
                    group,
                    element_page: handle,
                    neighbor_page,
                    reuse: Some(reuse),
                    first_free_page,
                    original_insert_page,
                });
            }

            if next != INVALID_PAGE {
                group.abort();
                current = next;
                continue;
            }

            let element_page = group.append_page()?;
            let element_id = group.page_id(element_page);
            group.page_mut(handle).set_next_page(element_id);

            let neighbor_page = if Page::new().free_space() >= combined {
                element_page
            } else {
                let neighbor_page = group.append_page()?;
                let neighbor_id = group.page_id(neighbor_page);
                group.page_mut(element_page).set_next_page(neighbor_id);
                neighbor_page
            };

            debug!(tail = current, page = element_id, "chain full, appended page");
            return Ok(Placement {
                group,
                element_page,
                neighbor_page,
                reuse: None,
                first_free_page,
                original_insert_page,
            });
        }
    }

    /// Scans a locked page for a deleted element whose two tuples can be
    /// overwritten by the new pair.
    ///
    /// The current entry point is never reused. A deleted element whose
    /// neighbor tuple lives on another page is skipped when that page is
    /// locked by someone else.
    fn find_free_slot<'s>(
        &'s self,
        group: &mut AtomicGroup<'s>,
        handle: PageHandle,
        element_size: usize,
        neighbor_size: usize,
        entry: Option<EntryPoint>,
        first_free_page: &mut Option<PageId>,
    ) -> Result<Option<(PageHandle, Reuse)>> {
        let page_id = group.page_id(handle);
        let page = group.page(handle);

        let mut tombstones = Vec::new();
        for slot in 0..page.slot_count() {
            let bytes = page.item(slot)?;
            if TupleKind::of(bytes) != Some(TupleKind::Element) {
                continue;
            }
            let (_, deleted, neighbor_location) = ElementTuple::peek(bytes)?;
            let location = TupleLocation::new(page_id, slot);
            if deleted && entry.is_none_or(|e| e.location != location) {
                tombstones.push((slot, bytes.len(), neighbor_location));
            }
        }

        for (element_slot, element_len, neighbor_location) in tombstones {
            if first_free_page.is_none() {
                *first_free_page = Some(neighbor_location.page);
            }

            let page = group.page(handle);
            if page.space_after_freeing(element_slot)? < element_size {
                continue;
            }
            let growth = element_size.saturating_sub(element_len);
            let reuse = Reuse { element_slot, neighbor_slot: neighbor_location.slot };

            if neighbor_location.page == page_id {
                if page.space_after_freeing(neighbor_location.slot)? >= neighbor_size + growth {
                    return Ok(Some((handle, reuse)));
                }
                continue;
            }

            let Some(guard) = self.store.try_lock_exclusive(neighbor_location.page)? else {
                trace!(page = neighbor_location.page, "neighbor page busy, skipping tombstone");
                continue;
            };

            // Stable while locked: only lock holders commit a page
            let neighbor_page = self.store.read_page(neighbor_location.page)?;
            if neighbor_page.space_after_freeing(neighbor_location.slot)? >= neighbor_size {
                let neighbor_handle = group.register(guard)?;
                return Ok(Some((neighbor_handle, reuse)));
            }
        }

        Ok(None)
    }
}
