use crate::hnsw::alloc::Placement;
use crate::hnsw::graph::HnswGraph;
use crate::hnsw::tuple::{ElementTuple, TupleLocation};
use crate::hnsw::Element;
use anyhow::{Context, Result};
use tracing::debug;

impl HnswGraph {
    /// Writes a new element's tuples in one atomic group.
    ///
    /// Reused tombstone slots are overwritten in place; otherwise both tuples
    /// are appended. The element tuple is stamped with its neighbor tuple's
    /// location before it is written. On success `element.location` and
    /// `element.neighbor_location` hold the committed locations.
    ///
    /// # Errors
    ///
    /// Returns an error if a tuple does not fit where the allocator placed
    /// it. Nothing is written in that case.
    pub(crate) fn write_new_element_pages(&self, element: &mut Element) -> Result<()> {
        let (mut element_tuple, neighbor_tuple) = element.to_tuples(self.params.m);
        let element_size = ElementTuple::encoded_size(element.vector.len());
        let neighbor_bytes = neighbor_tuple.to_bytes();

        let Placement {
            mut group,
            element_page,
            neighbor_page,
            reuse,
            first_free_page,
            original_insert_page,
        } = self.allocate(element_size, neighbor_bytes.len())?;

        let element_page_id = group.page_id(element_page);
        let neighbor_page_id = group.page_id(neighbor_page);

        let (element_slot, neighbor_slot) = match reuse {
            Some(reuse) => (reuse.element_slot, reuse.neighbor_slot),
            None => {
                let element_slot = group.page(element_page).slot_count();
                let neighbor_slot = if neighbor_page == element_page {
                    element_slot + 1
                } else {
                    group.page(neighbor_page).slot_count()
                };
                (element_slot, neighbor_slot)
            }
        };

        element_tuple.neighbor_location = TupleLocation::new(neighbor_page_id, neighbor_slot);
        let element_bytes = element_tuple.to_bytes();

        if reuse.is_some() {
            group
                .page_mut(element_page)
                .overwrite_item(element_slot, &element_bytes)
                .context("Failed to overwrite element tuple")?;
            group
                .page_mut(neighbor_page)
                .overwrite_item(neighbor_slot, &neighbor_bytes)
                .context("Failed to overwrite neighbor tuple")?;
        } else {
            let written = group
                .page_mut(element_page)
                .add_item(&element_bytes)
                .context("Failed to add element tuple")?;
            let written_neighbor = group
                .page_mut(neighbor_page)
                .add_item(&neighbor_bytes)
                .context("Failed to add neighbor tuple")?;

            if written != element_slot || written_neighbor != neighbor_slot {
                anyhow::bail!(
                    "Tuples landed in slots ({}, {}), expected ({}, {})",
                    written,
                    written_neighbor,
                    element_slot,
                    neighbor_slot
                );
            }
        }

        group.commit()?;

        element.location = TupleLocation::new(element_page_id, element_slot);
        element.neighbor_location = TupleLocation::new(neighbor_page_id, neighbor_slot);
        debug!(
            location = %element.location,
            neighbors = %element.neighbor_location,
            level = element.level,
            reused = reuse.is_some(),
            "wrote element"
        );

        // Keep future insertions probing near the frontier
        let cursor = neighbor_page_id;
        if cursor != original_insert_page && (reuse.is_none() || first_free_page == Some(cursor)) {
            self.update_insert_page(cursor)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;
    use crate::hnsw::{HnswParams, LayerSearch, RowId};
    use crate::page::{FIRST_DATA_PAGE, PAGE_SIZE};
    use crate::storage::PageStore;
    use tempfile::NamedTempFile;

    const DIMS: u32 = 900;

    fn graph(file: &NamedTempFile) -> HnswGraph {
        let header = Header::new(DIMS, 2, 0, PAGE_SIZE as u32, FIRST_DATA_PAGE);
        let store = PageStore::open(file.path(), &header).unwrap();
        HnswGraph::open(store, HnswParams { m: 2, ..HnswParams::default() }).unwrap()
    }

    fn insert(graph: &HnswGraph, seed: f32, level: u8) -> TupleLocation {
        let element = Element::new(level, vec![seed; DIMS as usize], RowId(seed as u64));
        graph
            .insert_element(&LayerSearch::default(), element)
            .unwrap()
            .location()
            .unwrap()
    }

    #[test]
    fn test_appended_pair_moves_cursor_to_neighbor_page() {
        let file = NamedTempFile::new().unwrap();
        let graph = graph(&file);

        insert(&graph, 1.0, 60);
        assert_eq!(graph.insert_page().unwrap(), FIRST_DATA_PAGE);

        // Element on page 1, neighbor tuple on a fresh page 2
        let second = insert(&graph, 2.0, 0);
        assert_eq!(second.page, FIRST_DATA_PAGE);
        assert_eq!(graph.insert_page().unwrap(), 2);
    }

    #[test]
    fn test_reuse_on_first_free_page_moves_cursor() {
        let file = NamedTempFile::new().unwrap();
        let graph = graph(&file);

        insert(&graph, 1.0, 60);
        let second = insert(&graph, 2.0, 0);
        assert_eq!(graph.load_element(second).unwrap().neighbor_location, TupleLocation::new(2, 0));

        assert!(graph.mark_deleted(second).unwrap());
        graph.update_insert_page(FIRST_DATA_PAGE).unwrap();

        // The first tombstone seen is reused, and its neighbor page is page 2
        let third = insert(&graph, 3.0, 0);
        assert_eq!(third, second);
        assert_eq!(graph.load_element(third).unwrap().neighbor_location, TupleLocation::new(2, 0));
        assert_eq!(graph.insert_page().unwrap(), 2);
    }

    #[test]
    fn test_reuse_past_first_free_page_keeps_cursor() {
        let file = NamedTempFile::new().unwrap();
        let graph = graph(&file);

        // page 1: a (level 60) + its neighbors, b (level 0) -> neighbors on page 2
        // page 2: b's neighbors, c + its neighbors, d (level 60) -> neighbors on page 3
        insert(&graph, 1.0, 60);
        let b = insert(&graph, 2.0, 0);
        let c = insert(&graph, 3.0, 0);
        let d = insert(&graph, 4.0, 60);

        assert_eq!(b, TupleLocation::new(1, 2));
        assert_eq!(c, TupleLocation::new(2, 1));
        assert_eq!(d, TupleLocation::new(2, 3));
        assert_eq!(graph.load_element(b).unwrap().neighbor_location, TupleLocation::new(2, 0));
        assert_eq!(graph.load_element(d).unwrap().neighbor_location, TupleLocation::new(3, 0));
        assert_eq!(graph.insert_page().unwrap(), 3);

        assert!(graph.mark_deleted(b).unwrap());
        assert!(graph.mark_deleted(d).unwrap());
        graph.update_insert_page(FIRST_DATA_PAGE).unwrap();

        // b's neighbor slot is too small for a level-60 tuple and page 2 has
        // no room to grow it, so d's slots are taken instead
        let e = insert(&graph, 5.0, 60);
        assert_eq!(e, d);
        assert_eq!(graph.load_element(e).unwrap().neighbor_location, TupleLocation::new(3, 0));
        assert!(graph.load_element(b).unwrap().deleted);

        // Page 3 is not the first page with free space
        assert_eq!(graph.insert_page().unwrap(), FIRST_DATA_PAGE);
    }
}
