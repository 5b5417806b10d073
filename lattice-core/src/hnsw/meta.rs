//! Entry point and insert cursor on the meta page.
//!
//! The meta page is locked only for the read-modify-write of its header,
//! never while element or neighbor tuples are being written.

use crate::header::{HEADER_SIZE, Header};
use crate::hnsw::graph::HnswGraph;
use crate::hnsw::tuple::TupleLocation;
use crate::hnsw::EntryPoint;
use crate::page::{META_PAGE, PageId};
use crate::storage::{AtomicGroup, PageHandle};
use anyhow::Result;
use tracing::debug;

/// Outcome of an entry-point promotion attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// The element is now the entry point
    Installed,
    /// A concurrent writer installed an entry point at least as high
    Superseded,
    /// The graph had no entry point when the element was searched, and a
    /// concurrent writer has since installed this one
    Raced(EntryPoint),
}

fn entry_point_of(header: &Header) -> Option<EntryPoint> {
    header.has_entry_point().then(|| EntryPoint {
        location: TupleLocation::new(header.entry_page, header.entry_slot),
        level: header.entry_level,
    })
}

fn header_in(group: &AtomicGroup<'_>, handle: PageHandle) -> Result<Header> {
    Header::from_bytes(group.page(handle).bytes())
}

fn store_header(group: &mut AtomicGroup<'_>, handle: PageHandle, header: &Header) {
    group.page_mut(handle).bytes_mut()[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
}

impl HnswGraph {
    /// Current entry point, if the graph has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the meta page cannot be read.
    pub fn entry_point(&self) -> Result<Option<EntryPoint>> {
        Ok(entry_point_of(&self.store.header()?))
    }

    /// Page new insertions probe first.
    ///
    /// # Errors
    ///
    /// Returns an error if the meta page cannot be read.
    pub fn insert_page(&self) -> Result<PageId> {
        Ok(self.store.header()?.insert_page)
    }

    /// Moves the insert cursor to `page`.
    pub(crate) fn update_insert_page(&self, page: PageId) -> Result<()> {
        let mut group = self.store.begin_group();
        let meta = group.register(self.store.lock_exclusive(META_PAGE)?)?;

        let mut header = header_in(&group, meta)?;
        header.insert_page = page;
        store_header(&mut group, meta, &header);
        group.commit()?;

        debug!(page, "advanced insert cursor");
        Ok(())
    }

    /// Installs `candidate` as entry point unless a concurrent writer got
    /// there first.
    ///
    /// `prior` is the entry point the element was searched against. With no
    /// prior entry point, any entry point found now means another writer won
    /// the race and the element must be reconnected against it. Otherwise
    /// the element is installed only if it still out-ranks the current one,
    /// so the entry point's level never decreases.
    pub(crate) fn promote_entry_point(
        &self,
        candidate: EntryPoint,
        prior: Option<EntryPoint>,
    ) -> Result<Promotion> {
        let mut group = self.store.begin_group();
        let meta = group.register(self.store.lock_exclusive(META_PAGE)?)?;
        let mut header = header_in(&group, meta)?;

        match (prior, entry_point_of(&header)) {
            (None, Some(current)) => {
                group.abort();
                debug!(current = %current.location, level = current.level, "lost entry point race");
                Ok(Promotion::Raced(current))
            }
            (_, Some(current)) if current.level >= candidate.level => {
                group.abort();
                Ok(Promotion::Superseded)
            }
            _ => {
                header.entry_page = candidate.location.page;
                header.entry_slot = candidate.location.slot;
                header.entry_level = candidate.level;
                store_header(&mut group, meta, &header);
                group.commit()?;

                debug!(location = %candidate.location, level = candidate.level, "installed entry point");
                Ok(Promotion::Installed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::HnswParams;
    use crate::page::{FIRST_DATA_PAGE, PAGE_SIZE};
    use crate::storage::PageStore;
    use tempfile::NamedTempFile;

    fn graph(file: &NamedTempFile) -> HnswGraph {
        let header = Header::new(2, 4, 0, PAGE_SIZE as u32, FIRST_DATA_PAGE);
        let store = PageStore::open(file.path(), &header).unwrap();
        HnswGraph::open(store, HnswParams { m: 4, ..HnswParams::default() }).unwrap()
    }

    fn entry(page: PageId, level: u8) -> EntryPoint {
        EntryPoint { location: TupleLocation::new(page, 0), level }
    }

    #[test]
    fn test_first_promotion_installs() {
        let file = NamedTempFile::new().unwrap();
        let graph = graph(&file);

        assert_eq!(graph.entry_point().unwrap(), None);
        assert_eq!(graph.promote_entry_point(entry(1, 2), None).unwrap(), Promotion::Installed);
        assert_eq!(graph.entry_point().unwrap(), Some(entry(1, 2)));
    }

    #[test]
    fn test_promotion_without_prior_detects_race() {
        let file = NamedTempFile::new().unwrap();
        let graph = graph(&file);

        graph.promote_entry_point(entry(1, 1), None).unwrap();
        let outcome = graph.promote_entry_point(entry(2, 3), None).unwrap();

        assert_eq!(outcome, Promotion::Raced(entry(1, 1)));
        assert_eq!(graph.entry_point().unwrap(), Some(entry(1, 1)));
    }

    #[test]
    fn test_entry_level_never_decreases() {
        let file = NamedTempFile::new().unwrap();
        let graph = graph(&file);

        graph.promote_entry_point(entry(1, 1), None).unwrap();
        graph.promote_entry_point(entry(2, 4), Some(entry(1, 1))).unwrap();

        // Searched against level 1, but level 4 is now installed
        let outcome = graph.promote_entry_point(entry(3, 2), Some(entry(1, 1))).unwrap();
        assert_eq!(outcome, Promotion::Superseded);
        assert_eq!(graph.entry_point().unwrap(), Some(entry(2, 4)));
    }

    #[test]
    fn test_insert_cursor_update() {
        let file = NamedTempFile::new().unwrap();
        let graph = graph(&file);

        assert_eq!(graph.insert_page().unwrap(), FIRST_DATA_PAGE);
        graph.update_insert_page(7).unwrap();
        assert_eq!(graph.insert_page().unwrap(), 7);
        assert_eq!(graph.entry_point().unwrap(), None);
    }
}
