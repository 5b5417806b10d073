//! Slotted page layout shared by element and neighbor tuples.
//!
//! # Layout
//!
//! ```text
//! +---------------------------+ 0
//! | Page header (16 bytes)    |
//! +---------------------------+ 16
//! | Item ids [offset:2,len:2] |  <- grows forward
//! +---------------------------+ 16 + 4 * slot_count
//! |        free space         |
//! +---------------------------+ upper
//! | Tuple data                |  <- grows backward from PAGE_SIZE
//! +---------------------------+ PAGE_SIZE
//! ```
//!
//! Header fields: `next_page: u32` (page chain link), `slot_count: u16`,
//! `upper: u16`, 8 reserved bytes. Slots are numbered from 0 and never
//! removed; overwriting a slot keeps its number.

use anyhow::{Context, Result};

/// Page size in bytes
pub const PAGE_SIZE: usize = 8192;

/// Page number within the store
pub type PageId = u32;

/// Slot number within a page
pub type SlotId = u16;

/// Sentinel for "no page" in chain links and locations
pub const INVALID_PAGE: PageId = PageId::MAX;

/// The meta page holding the file header, entry point and insert cursor
pub const META_PAGE: PageId = 0;

/// Root of the data page chain
pub const FIRST_DATA_PAGE: PageId = 1;

/// Size of the fixed page header
pub const PAGE_HEADER_SIZE: usize = 16;

/// Per-slot overhead (one item id)
pub const ITEM_ID_SIZE: usize = 4;

const NEXT_PAGE_AT: usize = 0;
const SLOT_COUNT_AT: usize = 4;
const UPPER_AT: usize = 6;

/// In-memory image of one page.
///
/// Pages are always worked on as private copies; only a committed
/// [`AtomicGroup`](crate::storage::AtomicGroup) writes an image back.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Box<[u8]>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("next_page", &self.next_page())
            .field("slot_count", &self.slot_count())
            .field("free_space", &self.free_space())
            .finish()
    }
}

impl Page {
    /// Creates an empty, initialized data page
    #[must_use]
    pub fn new() -> Self {
        let mut page = Self { data: vec![0u8; PAGE_SIZE].into_boxed_slice() };
        page.init();
        page
    }

    /// Wraps a raw page image.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not exactly one page long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            anyhow::bail!("Page image has {} bytes, expected {}", bytes.len(), PAGE_SIZE);
        }
        Ok(Self { data: bytes.into() })
    }

    /// Resets the page to an empty data page with no successor
    pub fn init(&mut self) {
        self.data.fill(0);
        self.set_next_page(INVALID_PAGE);
        self.set_slot_count(0);
        self.set_upper(PAGE_SIZE);
    }

    /// Raw page bytes
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw page bytes (used for the meta page, which is not slotted)
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Next page in the chain, or [`INVALID_PAGE`] at the tail
    #[must_use]
    pub fn next_page(&self) -> PageId {
        PageId::from_le_bytes(self.field::<4>(NEXT_PAGE_AT))
    }

    /// Links this page to its successor
    pub fn set_next_page(&mut self, next: PageId) {
        self.data[NEXT_PAGE_AT..NEXT_PAGE_AT + 4].copy_from_slice(&next.to_le_bytes());
    }

    /// Number of slots ever allocated on this page
    #[must_use]
    pub fn slot_count(&self) -> SlotId {
        SlotId::from_le_bytes(self.field::<2>(SLOT_COUNT_AT))
    }

    fn set_slot_count(&mut self, count: SlotId) {
        self.data[SLOT_COUNT_AT..SLOT_COUNT_AT + 2].copy_from_slice(&count.to_le_bytes());
    }

    fn upper(&self) -> usize {
        usize::from(u16::from_le_bytes(self.field::<2>(UPPER_AT)))
    }

    fn set_upper(&mut self, upper: usize) {
        // PAGE_SIZE (8192) fits in u16
        let upper = u16::try_from(upper).unwrap_or(u16::MAX);
        self.data[UPPER_AT..UPPER_AT + 2].copy_from_slice(&upper.to_le_bytes());
    }

    fn lower(&self) -> usize {
        PAGE_HEADER_SIZE + usize::from(self.slot_count()) * ITEM_ID_SIZE
    }

    fn field<const N: usize>(&self, at: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[at..at + N]);
        out
    }

    /// Free bytes for one more tuple, after reserving its item id.
    #[must_use]
    pub fn free_space(&self) -> usize {
        self.upper().saturating_sub(self.lower()).saturating_sub(ITEM_ID_SIZE)
    }

    /// Bytes a replacement for `slot` may occupy if the current tuple is freed.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot does not exist.
    pub fn space_after_freeing(&self, slot: SlotId) -> Result<usize> {
        let (_, len) = self.item_id(slot)?;
        Ok(self.upper().saturating_sub(self.lower()) + len)
    }

    fn item_id(&self, slot: SlotId) -> Result<(usize, usize)> {
        if slot >= self.slot_count() {
            anyhow::bail!("Slot {} out of range (slot count {})", slot, self.slot_count());
        }
        let at = PAGE_HEADER_SIZE + usize::from(slot) * ITEM_ID_SIZE;
        let offset = usize::from(u16::from_le_bytes(self.field::<2>(at)));
        let len = usize::from(u16::from_le_bytes(self.field::<2>(at + 2)));
        if offset < self.upper() || offset + len > PAGE_SIZE {
            anyhow::bail!("Corrupt item id for slot {}: offset {}, len {}", slot, offset, len);
        }
        Ok((offset, len))
    }

    fn set_item_id(&mut self, slot: SlotId, offset: usize, len: usize) -> Result<()> {
        let at = PAGE_HEADER_SIZE + usize::from(slot) * ITEM_ID_SIZE;
        let offset = u16::try_from(offset).context("Item offset exceeds page")?;
        let len = u16::try_from(len).context("Item length exceeds page")?;
        self.data[at..at + 2].copy_from_slice(&offset.to_le_bytes());
        self.data[at + 2..at + 4].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    /// Tuple bytes stored in `slot`.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot does not exist or its item id is corrupt.
    pub fn item(&self, slot: SlotId) -> Result<&[u8]> {
        let (offset, len) = self.item_id(slot)?;
        Ok(&self.data[offset..offset + len])
    }

    /// Appends a tuple in the next slot and returns that slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the page does not have room for the tuple.
    pub fn add_item(&mut self, tuple: &[u8]) -> Result<SlotId> {
        if tuple.len() > self.free_space() {
            anyhow::bail!(
                "Page full: tuple of {} bytes, {} bytes free",
                tuple.len(),
                self.free_space()
            );
        }

        let slot = self.slot_count();
        let offset = self.upper() - tuple.len();
        self.data[offset..offset + tuple.len()].copy_from_slice(tuple);
        self.set_slot_count(slot + 1);
        self.set_item_id(slot, offset, tuple.len())?;
        self.set_upper(offset);
        Ok(slot)
    }

    /// Replaces the tuple in `slot`, keeping the slot number.
    ///
    /// Same-size replacements are written in place. Otherwise the tuple area
    /// is repacked so the page never fragments.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot does not exist or the replacement does
    /// not fit once the old tuple is freed.
    pub fn overwrite_item(&mut self, slot: SlotId, tuple: &[u8]) -> Result<()> {
        let (offset, len) = self.item_id(slot)?;

        if len == tuple.len() {
            self.data[offset..offset + len].copy_from_slice(tuple);
            return Ok(());
        }

        if tuple.len() > self.space_after_freeing(slot)? {
            anyhow::bail!("Replacement tuple of {} bytes does not fit in slot {}", tuple.len(), slot);
        }

        let mut items = Vec::with_capacity(usize::from(self.slot_count()));
        for other in 0..self.slot_count() {
            if other == slot {
                items.push(tuple.to_vec());
            } else {
                items.push(self.item(other)?.to_vec());
            }
        }

        let mut upper = PAGE_SIZE;
        for (index, item) in items.iter().enumerate() {
            upper -= item.len();
            self.data[upper..upper + item.len()].copy_from_slice(item);
            let index = SlotId::try_from(index).context("Slot index overflow")?;
            self.set_item_id(index, upper, item.len())?;
        }
        let lower = self.lower();
        self.data[lower..upper].fill(0);
        self.set_upper(upper);
        Ok(())
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}
