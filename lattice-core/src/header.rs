/// Magic bytes identifying a Lattice index file
pub const MAGIC: &[u8; 8] = b"LATTICE\0";

/// Current file format version
pub const VERSION: u32 = 1;

/// Maximum supported vector dimensions.
/// An element tuple of this width still fits on an empty page.
pub const MAX_DIMENSIONS: u32 = 2000;

/// Encoded size of the header at the start of the meta page
pub const HEADER_SIZE: usize = 64;

/// Sentinel stored in page-id fields that point nowhere
const NO_PAGE: u32 = u32::MAX;

/// Header record stored at the start of the meta page (page 0).
///
/// The static half (magic through metric) is written once when the file is
/// created. The dynamic half (entry point and insert cursor) is rewritten by
/// meta page updates, always under the meta page lock.
///
/// # Layout (64 bytes, little-endian)
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       8     magic
/// 8       4     version
/// 12      4     page_size
/// 16      4     dimensions
/// 20      2     m
/// 22      1     metric
/// 23      1     reserved
/// 24      4     entry_page
/// 28      2     entry_slot
/// 30      1     entry_level
/// 31      1     reserved
/// 32      4     insert_page
/// 36      28    reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Magic bytes for file type identification
    pub magic: [u8; 8],

    /// File format version
    pub version: u32,

    /// Page size the file was written with
    pub page_size: u32,

    /// Number of dimensions per vector
    pub dimensions: u32,

    /// Fan-out per layer above 0
    pub m: u16,

    /// Distance metric tag
    pub metric: u8,

    /// Page of the entry point's element tuple (`u32::MAX` when the graph is empty)
    pub entry_page: u32,

    /// Slot of the entry point's element tuple
    pub entry_slot: u16,

    /// Level of the entry point
    pub entry_level: u8,

    /// Page new insertions probe first
    pub insert_page: u32,
}

impl Header {
    /// Creates a new header for an empty graph
    #[must_use]
    pub fn new(dimensions: u32, m: u16, metric: u8, page_size: u32, insert_page: u32) -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
            page_size,
            dimensions,
            m,
            metric,
            entry_page: NO_PAGE,
            entry_slot: 0,
            entry_level: 0,
            insert_page,
        }
    }

    /// Validates the header for correctness and compatibility
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == *MAGIC
            && self.version > 0
            && self.version <= VERSION
            && self.dimensions > 0
            && self.dimensions <= MAX_DIMENSIONS
            && self.m >= 2
            && self.insert_page != NO_PAGE
    }

    /// Returns true if an entry point has been installed
    #[must_use]
    pub fn has_entry_point(&self) -> bool {
        self.entry_page != NO_PAGE
    }

    /// Serializes the header
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.magic);
        bytes[8..12].copy_from_slice(&self.version.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.dimensions.to_le_bytes());
        bytes[20..22].copy_from_slice(&self.m.to_le_bytes());
        bytes[22] = self.metric;
        bytes[24..28].copy_from_slice(&self.entry_page.to_le_bytes());
        bytes[28..30].copy_from_slice(&self.entry_slot.to_le_bytes());
        bytes[30] = self.entry_level;
        bytes[32..36].copy_from_slice(&self.insert_page.to_le_bytes());
        bytes
    }

    /// Deserializes a header from the start of the meta page.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is shorter than [`HEADER_SIZE`].
    /// Field validation is left to [`Header::is_valid`].
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() < HEADER_SIZE {
            anyhow::bail!("Buffer too small for header: {} bytes", bytes.len());
        }

        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);

        Ok(Self {
            magic,
            version: u32_at(8),
            page_size: u32_at(12),
            dimensions: u32_at(16),
            m: u16_at(20),
            metric: bytes[22],
            entry_page: u32_at(24),
            entry_slot: u16_at(28),
            entry_level: bytes[30],
            insert_page: u32_at(32),
        })
    }
}
