//! On-disk element and neighbor tuples.
//!
//! # Element tuple
//!
//! ```text
//! Offset  Size        Field
//! ------  ----        -----
//! 0       1           kind (1)
//! 1       1           level
//! 2       1           deleted
//! 3       1           reserved
//! 4       2           dimensions
//! 6       6           neighbor tuple location
//! 12      8 * 10      row references
//! 92      4 * dims    vector (f32)
//! ```
//!
//! # Neighbor tuple
//!
//! ```text
//! 0       1           kind (2)
//! 1       1           reserved
//! 2       2           count = (level + 2) * m
//! 4       6 * count   element tuple locations
//! ```
//!
//! The neighbor array is split into per-layer segments, top layer first.
//! Layer `l` of an element at `level` starts at `(level - l) * m` and holds
//! `layer_capacity(m, l)` slots, so layer 0 takes the final `2m`.
//!
//! Both tuple kinds are padded to a multiple of 8 bytes.

use crate::page::{INVALID_PAGE, ITEM_ID_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE, PageId, SlotId};
use anyhow::Result;
use std::ops::Range;

/// Maximum row references an element tuple can carry
pub const MAX_ROW_REFS: usize = 10;

/// Encoded size of a [`TupleLocation`]
pub const LOCATION_SIZE: usize = 6;

/// Hard cap on levels, independent of page geometry
pub const MAX_LEVEL_CAP: u8 = 255;

const ELEMENT_KIND: u8 = 1;
const NEIGHBOR_KIND: u8 = 2;
const ELEMENT_HEADER_SIZE: usize = 12 + MAX_ROW_REFS * 8;
const NEIGHBOR_HEADER_SIZE: usize = 4;

/// Location of a tuple: page plus slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleLocation {
    /// Page holding the tuple
    pub page: PageId,
    /// Slot within the page
    pub slot: SlotId,
}

impl TupleLocation {
    /// Marks an unused neighbor slot
    pub const INVALID: Self = Self { page: INVALID_PAGE, slot: 0 };

    /// Creates a location
    #[must_use]
    pub const fn new(page: PageId, slot: SlotId) -> Self {
        Self { page, slot }
    }

    /// Returns true unless this is the unused-slot sentinel
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.page != INVALID_PAGE
    }

    fn encode(self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.page.to_le_bytes());
        out[4..6].copy_from_slice(&self.slot.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            page: PageId::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            slot: SlotId::from_le_bytes([bytes[4], bytes[5]]),
        }
    }
}

impl std::fmt::Display for TupleLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.page, self.slot)
    }
}

/// Reference to a row in the owning table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowId(pub u64);

impl RowId {
    /// Marks an unused row reference slot
    pub const INVALID: Self = Self(u64::MAX);

    /// Returns true unless this is the unused-slot sentinel
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.0 != u64::MAX
    }
}

/// Kind tag stored in the first byte of every tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleKind {
    /// An [`ElementTuple`]
    Element,
    /// A [`NeighborTuple`]
    Neighbor,
}

impl TupleKind {
    /// Reads the kind tag of an encoded tuple
    #[must_use]
    pub fn of(bytes: &[u8]) -> Option<Self> {
        match bytes.first() {
            Some(&ELEMENT_KIND) => Some(Self::Element),
            Some(&NEIGHBOR_KIND) => Some(Self::Neighbor),
            _ => None,
        }
    }
}

const fn align8(size: usize) -> usize {
    (size + 7) & !7
}

/// Neighbor slots reserved per layer: `2m` at layer 0, `m` above.
#[inline]
#[must_use]
pub const fn layer_capacity(m: usize, layer: usize) -> usize {
    if layer == 0 { 2 * m } else { m }
}

/// Largest fan-out whose level-0 neighbor tuple fits on an empty page.
#[must_use]
pub fn max_fan_out() -> usize {
    let usable = PAGE_SIZE - PAGE_HEADER_SIZE - ITEM_ID_SIZE;
    let mut m = 1;
    while NeighborTuple::encoded_size(0, m + 1) <= usable {
        m += 1;
    }
    m
}

/// Highest level whose neighbor tuple still fits on an empty page.
#[must_use]
pub fn max_level(m: usize) -> u8 {
    let usable = PAGE_SIZE - PAGE_HEADER_SIZE - ITEM_ID_SIZE;
    let mut level = 0u8;
    while level < MAX_LEVEL_CAP && NeighborTuple::encoded_size(level + 1, m) <= usable {
        level += 1;
    }
    level
}

/// Element tuple: one graph node's vector, row references and adjacency pointer
#[derive(Debug, Clone, PartialEq)]
pub struct ElementTuple {
    /// Level assigned at creation
    pub level: u8,
    /// Tombstone flag
    pub deleted: bool,
    /// Where this element's neighbor tuple lives
    pub neighbor_location: TupleLocation,
    /// Row references; unused slots hold [`RowId::INVALID`]
    pub row_refs: [RowId; MAX_ROW_REFS],
    /// The vector
    pub vector: Vec<f32>,
}

impl ElementTuple {
    /// Creates a live element tuple carrying one row reference
    #[must_use]
    pub fn new(level: u8, vector: Vec<f32>, row: RowId) -> Self {
        let mut row_refs = [RowId::INVALID; MAX_ROW_REFS];
        row_refs[0] = row;
        Self {
            level,
            deleted: false,
            neighbor_location: TupleLocation::INVALID,
            row_refs,
            vector,
        }
    }

    /// Encoded size for a vector of `dimensions`
    #[must_use]
    pub const fn encoded_size(dimensions: usize) -> usize {
        align8(ELEMENT_HEADER_SIZE + dimensions * 4)
    }

    /// Index of the first unused row reference, if any
    #[must_use]
    pub fn first_free_row_slot(&self) -> Option<usize> {
        self.row_refs.iter().position(|r| !r.is_valid())
    }

    /// Live row references
    pub fn rows(&self) -> impl Iterator<Item = RowId> + '_ {
        self.row_refs.iter().copied().filter(RowId::is_valid)
    }

    /// Serializes the tuple
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; Self::encoded_size(self.vector.len())];
        bytes[0] = ELEMENT_KIND;
        bytes[1] = self.level;
        bytes[2] = u8::from(self.deleted);
        let dims = u16::try_from(self.vector.len()).unwrap_or(u16::MAX);
        bytes[4..6].copy_from_slice(&dims.to_le_bytes());
        self.neighbor_location.encode(&mut bytes[6..12]);

        for (i, row) in self.row_refs.iter().enumerate() {
            let at = 12 + i * 8;
            bytes[at..at + 8].copy_from_slice(&row.0.to_le_bytes());
        }

        for (i, value) in self.vector.iter().enumerate() {
            let at = ELEMENT_HEADER_SIZE + i * 4;
            bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }

        bytes
    }

    /// Deserializes an element tuple.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not an element tuple or are truncated.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (level, deleted, neighbor_location) = Self::peek(bytes)?;
        let dims = usize::from(u16::from_le_bytes([bytes[4], bytes[5]]));

        if bytes.len() < Self::encoded_size(dims) {
            anyhow::bail!(
                "Element tuple truncated: {} bytes for {} dimensions",
                bytes.len(),
                dims
            );
        }

        let mut row_refs = [RowId::INVALID; MAX_ROW_REFS];
        for (i, row) in row_refs.iter_mut().enumerate() {
            let at = 12 + i * 8;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            *row = RowId(u64::from_le_bytes(raw));
        }

        let vector = bytes[ELEMENT_HEADER_SIZE..ELEMENT_HEADER_SIZE + dims * 4]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self { level, deleted, neighbor_location, row_refs, vector })
    }

    /// Reads level, deleted flag and neighbor location without decoding the vector.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not an element tuple.
    pub fn peek(bytes: &[u8]) -> Result<(u8, bool, TupleLocation)> {
        if TupleKind::of(bytes) != Some(TupleKind::Element) {
            anyhow::bail!("Not an element tuple");
        }
        if bytes.len() < ELEMENT_HEADER_SIZE {
            anyhow::bail!("Element tuple truncated: {} bytes", bytes.len());
        }
        Ok((bytes[1], bytes[2] != 0, TupleLocation::decode(&bytes[6..12])))
    }
}

/// Neighbor tuple: the flattened per-layer adjacency of one element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborTuple {
    /// All neighbor slots; unused ones hold [`TupleLocation::INVALID`]
    pub slots: Vec<TupleLocation>,
}

impl NeighborTuple {
    /// Number of slots for an element at `level`
    #[must_use]
    pub const fn slot_count(level: u8, m: usize) -> usize {
        (level as usize + 2) * m
    }

    /// Encoded size for an element at `level`
    #[must_use]
    pub const fn encoded_size(level: u8, m: usize) -> usize {
        align8(NEIGHBOR_HEADER_SIZE + Self::slot_count(level, m) * LOCATION_SIZE)
    }

    /// Slot range of `layer` within the tuple of an element at `level`.
    ///
    /// Empty when `layer` is above `level`.
    #[must_use]
    pub fn layer_range(level: u8, layer: usize, m: usize) -> Range<usize> {
        let level = usize::from(level);
        if layer > level {
            return 0..0;
        }
        let start = (level - layer) * m;
        start..start + layer_capacity(m, layer)
    }

    /// Creates a tuple with every slot unused
    #[must_use]
    pub fn empty(level: u8, m: usize) -> Self {
        Self { slots: vec![TupleLocation::INVALID; Self::slot_count(level, m)] }
    }

    /// Valid neighbors stored in `layer`, in slot order
    pub fn layer(&self, level: u8, layer: usize, m: usize) -> impl Iterator<Item = TupleLocation> + '_ {
        let range = Self::layer_range(level, layer, m);
        let end = range.end.min(self.slots.len());
        let start = range.start.min(end);
        self.slots[start..end].iter().copied().filter(TupleLocation::is_valid)
    }

    /// Fills `layer` from `neighbors`, truncating to the layer's capacity
    pub fn set_layer(&mut self, level: u8, layer: usize, m: usize, neighbors: &[TupleLocation]) {
        let range = Self::layer_range(level, layer, m);
        for (i, slot) in range.enumerate() {
            if let Some(target) = self.slots.get_mut(slot) {
                *target = neighbors.get(i).copied().unwrap_or(TupleLocation::INVALID);
            }
        }
    }

    /// Serializes the tuple
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = align8(NEIGHBOR_HEADER_SIZE + self.slots.len() * LOCATION_SIZE);
        let mut bytes = vec![0u8; size];
        bytes[0] = NEIGHBOR_KIND;
        let count = u16::try_from(self.slots.len()).unwrap_or(u16::MAX);
        bytes[2..4].copy_from_slice(&count.to_le_bytes());

        for (i, location) in self.slots.iter().enumerate() {
            let at = NEIGHBOR_HEADER_SIZE + i * LOCATION_SIZE;
            location.encode(&mut bytes[at..at + LOCATION_SIZE]);
        }

        bytes
    }

    /// Deserializes a neighbor tuple.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a neighbor tuple or are truncated.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if TupleKind::of(bytes) != Some(TupleKind::Neighbor) {
            anyhow::bail!("Not a neighbor tuple");
        }
        if bytes.len() < NEIGHBOR_HEADER_SIZE {
            anyhow::bail!("Neighbor tuple truncated: {} bytes", bytes.len());
        }

        let count = usize::from(u16::from_le_bytes([bytes[2], bytes[3]]));
        let end = NEIGHBOR_HEADER_SIZE + count * LOCATION_SIZE;
        if bytes.len() < end {
            anyhow::bail!("Neighbor tuple truncated: {} bytes for {} slots", bytes.len(), count);
        }

        let slots = bytes[NEIGHBOR_HEADER_SIZE..end]
            .chunks_exact(LOCATION_SIZE)
            .map(TupleLocation::decode)
            .collect();

        Ok(Self { slots })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_capacity() {
        assert_eq!(layer_capacity(16, 0), 32);
        assert_eq!(layer_capacity(16, 1), 16);
        assert_eq!(layer_capacity(16, 7), 16);
    }

    #[test]
    fn test_neighbor_layout_puts_top_layer_first() {
        // level 2, m = 4: layer 2 -> 0..4, layer 1 -> 4..8, layer 0 -> 8..16
        assert_eq!(NeighborTuple::slot_count(2, 4), 16);
        assert_eq!(NeighborTuple::layer_range(2, 2, 4), 0..4);
        assert_eq!(NeighborTuple::layer_range(2, 1, 4), 4..8);
        assert_eq!(NeighborTuple::layer_range(2, 0, 4), 8..16);
        assert_eq!(NeighborTuple::layer_range(2, 3, 4), 0..0);
    }

    #[test]
    fn test_sizes_are_8_byte_aligned() {
        for dims in [1, 3, 128, 768] {
            assert_eq!(ElementTuple::encoded_size(dims) % 8, 0);
        }
        for level in 0..5 {
            assert_eq!(NeighborTuple::encoded_size(level, 16) % 8, 0);
        }
    }

    #[test]
    fn test_element_tuple_encoding() {
        let mut tuple = ElementTuple::new(3, vec![0.5, -1.25, 8.0], RowId(77));
        tuple.neighbor_location = TupleLocation::new(4, 2);
        tuple.row_refs[1] = RowId(78);

        let bytes = tuple.to_bytes();
        assert_eq!(bytes.len(), ElementTuple::encoded_size(3));
        assert_eq!(TupleKind::of(&bytes), Some(TupleKind::Element));

        let restored = ElementTuple::from_bytes(&bytes).unwrap();
        assert_eq!(restored, tuple);
        assert_eq!(restored.first_free_row_slot(), Some(2));
        assert_eq!(restored.rows().collect::<Vec<_>>(), vec![RowId(77), RowId(78)]);

        let (level, deleted, neighbors) = ElementTuple::peek(&bytes).unwrap();
        assert_eq!((level, deleted, neighbors), (3, false, TupleLocation::new(4, 2)));
    }

    #[test]
    fn test_neighbor_tuple_layers() {
        let m = 2;
        let mut tuple = NeighborTuple::empty(1, m);
        tuple.set_layer(1, 1, m, &[TupleLocation::new(1, 0)]);
        tuple.set_layer(1, 0, m, &[TupleLocation::new(1, 1), TupleLocation::new(2, 0)]);

        let restored = NeighborTuple::from_bytes(&tuple.to_bytes()).unwrap();
        assert_eq!(restored.slots.len(), 6);
        assert_eq!(restored.layer(1, 1, m).collect::<Vec<_>>(), vec![TupleLocation::new(1, 0)]);
        assert_eq!(
            restored.layer(1, 0, m).collect::<Vec<_>>(),
            vec![TupleLocation::new(1, 1), TupleLocation::new(2, 0)]
        );
    }

    #[test]
    fn test_set_layer_truncates_to_capacity() {
        let m = 2;
        let mut tuple = NeighborTuple::empty(1, m);
        let many: Vec<_> = (0..5).map(|s| TupleLocation::new(9, s)).collect();
        tuple.set_layer(1, 1, m, &many);
        assert_eq!(tuple.layer(1, 1, m).count(), 2);
        assert_eq!(tuple.layer(1, 0, m).count(), 0);
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let neighbor = NeighborTuple::empty(0, 4).to_bytes();
        assert!(ElementTuple::from_bytes(&neighbor).is_err());

        let element = ElementTuple::new(0, vec![1.0], RowId(1)).to_bytes();
        assert!(NeighborTuple::from_bytes(&element).is_err());
    }

    #[test]
    fn test_max_level_fits_page() {
        for m in [2, 4, 16, 48] {
            let level = max_level(m);
            assert!(
                NeighborTuple::encoded_size(level, m)
                    <= PAGE_SIZE - PAGE_HEADER_SIZE - ITEM_ID_SIZE
            );
        }
        assert!(max_level(16) > 8);
    }

    #[test]
    fn test_max_fan_out_fits_page() {
        let usable = PAGE_SIZE - PAGE_HEADER_SIZE - ITEM_ID_SIZE;
        let m = max_fan_out();

        assert_eq!(m, 680);
        assert!(NeighborTuple::encoded_size(0, m) <= usable);
        assert!(NeighborTuple::encoded_size(0, m + 1) > usable);
    }
}
