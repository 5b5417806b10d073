use crate::hnsw::HnswParams;
use crate::hnsw::tuple::{ElementTuple, NeighborTuple, TupleKind, TupleLocation};
use crate::page::{FIRST_DATA_PAGE, INVALID_PAGE, Page, PageId};
use crate::storage::PageStore;
use anyhow::{Context, Result};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

/// HNSW graph laid out on the slotted pages of a [`PageStore`].
///
/// The graph holds no in-memory adjacency. Every relation is a
/// [`TupleLocation`] read back from committed pages, so a handle is safe to
/// share between writer threads.
#[derive(Debug)]
pub struct HnswGraph {
    pub(crate) store: PageStore,
    pub(crate) params: HnswParams,
    dimensions: usize,
}

impl HnswGraph {
    /// Wraps an opened store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store's header cannot be read.
    pub fn open(store: PageStore, params: HnswParams) -> Result<Self> {
        let header = store.header()?;
        let dimensions = usize::try_from(header.dimensions).context("Dimensions overflow usize")?;
        Ok(Self { store, params, dimensions })
    }

    /// Underlying page store
    #[must_use]
    pub fn store(&self) -> &PageStore {
        &self.store
    }

    /// Construction parameters
    #[must_use]
    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Vector width
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Distance between two stored vectors under the graph's metric
    #[inline]
    #[must_use]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        self.params.metric.distance(a, b)
    }

    /// Reads the element tuple at `location`.
    ///
    /// # Errors
    ///
    /// Returns an error if the location does not hold an element tuple.
    pub fn load_element(&self, location: TupleLocation) -> Result<ElementTuple> {
        let page = self.store.read_page(location.page)?;
        element_on(&page, location)
    }

    /// Reads the neighbor tuple at `location`.
    ///
    /// # Errors
    ///
    /// Returns an error if the location does not hold a neighbor tuple.
    pub fn load_neighbor_tuple(&self, location: TupleLocation) -> Result<NeighborTuple> {
        let page = self.store.read_page(location.page)?;
        neighbor_tuple_on(&page, location)
    }

    /// Neighbors of `element` at `layer`, read from its neighbor tuple.
    ///
    /// # Errors
    ///
    /// Returns an error if the neighbor tuple cannot be read.
    pub fn neighbors(&self, element: &ElementTuple, layer: usize) -> Result<Vec<TupleLocation>> {
        if layer > usize::from(element.level) {
            return Ok(Vec::new());
        }
        let tuple = self.load_neighbor_tuple(element.neighbor_location)?;
        Ok(tuple.layer(element.level, layer, self.params.m).collect())
    }

    /// Pages of the data chain, in chain order.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read or the chain loops.
    pub fn chain(&self) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut seen = HashSet::new();
        let mut current = FIRST_DATA_PAGE;

        while current != INVALID_PAGE {
            if !seen.insert(current) {
                anyhow::bail!("Page chain loops back to page {}", current);
            }
            pages.push(current);
            current = self.store.read_page(current)?.next_page();
        }

        Ok(pages)
    }

    /// Every element tuple in the data chain, deleted ones included.
    ///
    /// # Errors
    ///
    /// Returns an error if a page or tuple is corrupt.
    pub fn scan_elements(&self) -> Result<Vec<(TupleLocation, ElementTuple)>> {
        let mut elements = Vec::new();

        for page_id in self.chain()? {
            let page = self.store.read_page(page_id)?;
            for slot in 0..page.slot_count() {
                let bytes = page.item(slot)?;
                if TupleKind::of(bytes) == Some(TupleKind::Element) {
                    elements.push((TupleLocation::new(page_id, slot), ElementTuple::from_bytes(bytes)?));
                }
            }
        }

        Ok(elements)
    }
}

/// Decodes the element tuple at `location` from an already-read page
pub(crate) fn element_on(page: &Page, location: TupleLocation) -> Result<ElementTuple> {
    let bytes = page.item(location.slot)?;
    ElementTuple::from_bytes(bytes).with_context(|| format!("Bad element tuple at {location}"))
}

/// Decodes the neighbor tuple at `location` from an already-read page
pub(crate) fn neighbor_tuple_on(page: &Page, location: TupleLocation) -> Result<NeighborTuple> {
    let bytes = page.item(location.slot)?;
    NeighborTuple::from_bytes(bytes).with_context(|| format!("Bad neighbor tuple at {location}"))
}

/// Committed page images read during one operation.
///
/// Each page is copied out of the store at most once, so a search or a
/// reload that touches many tuples on the same page pays one copy.
#[derive(Debug, Default)]
pub(crate) struct PageCache {
    pages: HashMap<PageId, Page>,
}

impl PageCache {
    fn page(&mut self, graph: &HnswGraph, id: PageId) -> Result<&Page> {
        Ok(match self.pages.entry(id) {
            Entry::Occupied(cached) => cached.into_mut(),
            Entry::Vacant(slot) => slot.insert(graph.store.read_page(id)?),
        })
    }

    pub(crate) fn element(&mut self, graph: &HnswGraph, location: TupleLocation) -> Result<ElementTuple> {
        element_on(self.page(graph, location.page)?, location)
    }

    pub(crate) fn neighbor_tuple(
        &mut self,
        graph: &HnswGraph,
        location: TupleLocation,
    ) -> Result<NeighborTuple> {
        neighbor_tuple_on(self.page(graph, location.page)?, location)
    }

    /// Neighbors of `element` at `layer`
    pub(crate) fn neighbors(
        &mut self,
        graph: &HnswGraph,
        element: &ElementTuple,
        layer: usize,
    ) -> Result<Vec<TupleLocation>> {
        if layer > usize::from(element.level) {
            return Ok(Vec::new());
        }
        let tuple = self.neighbor_tuple(graph, element.neighbor_location)?;
        Ok(tuple.layer(element.level, layer, graph.params.m).collect())
    }
}
