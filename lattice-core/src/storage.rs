use crate::header::{HEADER_SIZE, Header};
use crate::page::{PAGE_SIZE, Page, PageId};
use anyhow::{Context, Result};
use fs2::FileExt;
use memmap2::MmapMut;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::debug;

/// What a lock-table entry protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LockTag {
    /// Exclusive access to one page
    Page(PageId),
    /// Right to grow the file
    Extend,
}

/// Table of held exclusive locks.
///
/// Waiters park on a single condition variable; locks are short-held so
/// the broadcast on release is cheap.
#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashSet<LockTag>>,
    released: Condvar,
}

impl LockTable {
    fn acquire(&self, tag: LockTag) {
        let mut held = self.held.lock();
        while held.contains(&tag) {
            self.released.wait(&mut held);
        }
        held.insert(tag);
    }

    fn try_acquire(&self, tag: LockTag) -> bool {
        self.held.lock().insert(tag)
    }

    fn release(&self, tag: LockTag) {
        self.held.lock().remove(&tag);
        self.released.notify_all();
    }
}

/// Lock-table entry held until drop
#[derive(Debug)]
struct LockHold<'s> {
    store: &'s PageStore,
    tag: LockTag,
}

impl Drop for LockHold<'_> {
    fn drop(&mut self) {
        self.store.locks.release(self.tag);
    }
}

/// Exclusive lock on one page, released on drop
#[derive(Debug)]
pub struct PageGuard<'s> {
    _hold: LockHold<'s>,
    page: PageId,
}

impl PageGuard<'_> {
    /// The locked page
    #[must_use]
    pub fn page_id(&self) -> PageId {
        self.page
    }
}

/// Handle to a page registered in an [`AtomicGroup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHandle(usize);

#[derive(Debug)]
struct RegisteredPage<'s> {
    id: PageId,
    image: Page,
    _guard: PageGuard<'s>,
}

/// A set of pages mutated together and committed atomically.
///
/// Registering a page copies its committed image into the group; all
/// mutation happens on those copies. `commit` writes every image back in
/// one step under the store's map lock. `abort`, or dropping the group,
/// discards the copies, so an aborted group has no observable effect.
///
/// Page images borrowed from the group cannot outlive it:
///
/// ```compile_fail
/// # use lattice_core::storage::PageStore;
/// # fn demo(store: &PageStore) -> anyhow::Result<()> {
/// let mut group = store.begin_group();
/// let handle = group.register(store.lock_exclusive(1)?)?;
/// let page = group.page_mut(handle);
/// group.commit()?;
/// page.set_next_page(2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct AtomicGroup<'s> {
    store: &'s PageStore,
    pages: Vec<RegisteredPage<'s>>,
    extension: Option<LockHold<'s>>,
    committed_pages: PageId,
    appended: PageId,
}

impl<'s> AtomicGroup<'s> {
    /// Registers a locked page and returns a handle to its private image.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is already registered or cannot be read.
    pub fn register(&mut self, guard: PageGuard<'s>) -> Result<PageHandle> {
        let id = guard.page_id();
        if self.pages.iter().any(|p| p.id == id) {
            anyhow::bail!("Page {} registered twice in one group", id);
        }
        let image = self.store.read_page(id)?;
        self.pages.push(RegisteredPage { id, image, _guard: guard });
        Ok(PageHandle(self.pages.len() - 1))
    }

    /// Reserves a fresh page at the end of the file and registers it.
    ///
    /// The storage-growth lock is taken on the first append and held until
    /// the group finishes, so concurrent appenders never receive the same
    /// page id. The file itself only grows on commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the page id space is exhausted.
    pub fn append_page(&mut self) -> Result<PageHandle> {
        if self.extension.is_none() {
            self.extension = Some(self.store.lock_extension());
            self.committed_pages = self.store.page_count();
        }

        let id = self
            .committed_pages
            .checked_add(self.appended)
            .context("Page id space exhausted")?;
        self.appended += 1;

        let guard = self.store.lock_exclusive_unchecked(id);
        self.pages.push(RegisteredPage { id, image: Page::new(), _guard: guard });

        debug!(page = id, "reserved new page");
        Ok(PageHandle(self.pages.len() - 1))
    }

    /// Page id behind a handle
    #[must_use]
    pub fn page_id(&self, handle: PageHandle) -> PageId {
        self.pages[handle.0].id
    }

    /// Private image of a registered page
    #[must_use]
    pub fn page(&self, handle: PageHandle) -> &Page {
        &self.pages[handle.0].image
    }

    /// Mutable private image of a registered page
    pub fn page_mut(&mut self, handle: PageHandle) -> &mut Page {
        &mut self.pages[handle.0].image
    }

    /// Writes every registered image back and releases all locks.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be grown for appended pages.
    /// Nothing is written in that case.
    pub fn commit(self) -> Result<()> {
        let mut mmap = self.store.mmap.write();

        let existing = (mmap.len() / PAGE_SIZE) as u64;
        let pages = u64::from(self.committed_pages) + u64::from(self.appended);
        let limit = if self.appended > 0 { pages } else { existing };
        if let Some(page) = self.pages.iter().find(|p| u64::from(p.id) >= limit) {
            anyhow::bail!("Commit of page {} beyond end of store ({} pages)", page.id, limit);
        }

        if self.appended > 0 {
            self.store
                .file
                .set_len(pages * PAGE_SIZE as u64)
                .context("Failed to extend page store")?;
            // SAFETY: the write lock excludes every other view of the mapping
            *mmap = unsafe { MmapMut::map_mut(&self.store.file)? };
        }

        for page in &self.pages {
            let start = page.id as usize * PAGE_SIZE;
            mmap[start..start + PAGE_SIZE].copy_from_slice(page.image.bytes());
        }

        Ok(())
    }

    /// Discards every registered image and releases all locks
    pub fn abort(self) {}
}

/// Page store backed by one memory-mapped file
#[derive(Debug)]
pub struct PageStore {
    /// File handle (owns the file lock)
    file: File,

    /// Memory-mapped view of the file
    mmap: RwLock<MmapMut>,

    /// Exclusive page locks and the storage-growth lock
    locks: LockTable,
}

impl PageStore {
    /// Opens or creates a page store.
    ///
    /// A new file is initialized with `template` on the meta page and one
    /// empty data page. An existing file must carry a header with the same
    /// dimensions, fan-out and metric as `template`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened or created
    /// - The file is already locked by another process
    /// - The file is corrupted or was created with different parameters
    pub fn open<P: AsRef<Path>>(path: P, template: &Header) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lattice file: {}", path.display()))?;

        file.try_lock_exclusive()
            .context("Lattice file is already open by another process")?;

        let len = file.metadata().map(|m| m.len()).unwrap_or(0);

        if len == 0 {
            file.set_len(2 * PAGE_SIZE as u64)?;

            // SAFETY: the file was just created and is exclusively locked
            let mut mmap = unsafe { MmapMut::map_mut(&file)? };
            let mut meta = [0u8; PAGE_SIZE];
            meta[..HEADER_SIZE].copy_from_slice(&template.to_bytes());
            mmap[..PAGE_SIZE].copy_from_slice(&meta);
            mmap[PAGE_SIZE..2 * PAGE_SIZE].copy_from_slice(Page::new().bytes());
            mmap.flush()?;
            debug!(path = %path.display(), "initialized page store");
        }

        // SAFETY: the file is exclusively locked for the lifetime of the store
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        if mmap.len() < 2 * PAGE_SIZE || mmap.len() % PAGE_SIZE != 0 {
            anyhow::bail!("File is not a valid Lattice index: {}", path.display());
        }

        let header = Header::from_bytes(&mmap[..HEADER_SIZE])?;

        if !header.is_valid() || header.page_size as usize != PAGE_SIZE {
            anyhow::bail!("Corrupted or incompatible Lattice file at {}", path.display());
        }

        if header.dimensions != template.dimensions {
            anyhow::bail!(
                "Dimension mismatch: file has {}, requested {}",
                header.dimensions,
                template.dimensions
            );
        }

        if header.m != template.m || header.metric != template.metric {
            anyhow::bail!(
                "Graph parameter mismatch: file has m={} metric={}, requested m={} metric={}",
                header.m,
                header.metric,
                template.m,
                template.metric
            );
        }

        Ok(Self { file, mmap: RwLock::new(mmap), locks: LockTable::default() })
    }

    /// Number of committed pages
    #[must_use]
    pub fn page_count(&self) -> PageId {
        PageId::try_from(self.mmap.read().len() / PAGE_SIZE).unwrap_or(PageId::MAX)
    }

    /// Returns a copy of the committed image of a page.
    ///
    /// # Errors
    ///
    /// Returns an error if the page does not exist.
    pub fn read_page(&self, id: PageId) -> Result<Page> {
        let mmap = self.mmap.read();
        let start = id as usize * PAGE_SIZE;
        let end = start + PAGE_SIZE;
        if end > mmap.len() {
            anyhow::bail!("Page {} out of bounds (store has {} pages)", id, mmap.len() / PAGE_SIZE);
        }
        Page::from_bytes(&mmap[start..end])
    }

    /// Reads and decodes the header on the meta page.
    ///
    /// # Errors
    ///
    /// Returns an error if the meta page cannot be read.
    pub fn header(&self) -> Result<Header> {
        let mmap = self.mmap.read();
        Header::from_bytes(&mmap[..HEADER_SIZE])
    }

    /// Blocks until an exclusive lock on `id` is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the page does not exist.
    pub fn lock_exclusive(&self, id: PageId) -> Result<PageGuard<'_>> {
        if id >= self.page_count() {
            anyhow::bail!("Cannot lock page {}: store has {} pages", id, self.page_count());
        }
        Ok(self.lock_exclusive_unchecked(id))
    }

    /// Takes an exclusive lock on `id` only if nobody holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the page does not exist.
    pub fn try_lock_exclusive(&self, id: PageId) -> Result<Option<PageGuard<'_>>> {
        if id >= self.page_count() {
            anyhow::bail!("Cannot lock page {}: store has {} pages", id, self.page_count());
        }
        let tag = LockTag::Page(id);
        Ok(self
            .locks
            .try_acquire(tag)
            .then(|| PageGuard { _hold: LockHold { store: self, tag }, page: id }))
    }

    fn lock_exclusive_unchecked(&self, id: PageId) -> PageGuard<'_> {
        let tag = LockTag::Page(id);
        self.locks.acquire(tag);
        PageGuard { _hold: LockHold { store: self, tag }, page: id }
    }

    fn lock_extension(&self) -> LockHold<'_> {
        self.locks.acquire(LockTag::Extend);
        LockHold { store: self, tag: LockTag::Extend }
    }

    /// Starts an empty atomic group
    #[must_use]
    pub fn begin_group(&self) -> AtomicGroup<'_> {
        AtomicGroup {
            store: self,
            pages: Vec::new(),
            extension: None,
            committed_pages: 0,
            appended: 0,
        }
    }

    /// Raw bytes of the whole store, for snapshot comparison
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.mmap.read().to_vec()
    }

    /// Forces all committed pages to disk.
    ///
    /// Flushes the memory map to the kernel page cache and then forces a
    /// physical write with fsync, including file-size metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or sync fails.
    pub fn flush(&self) -> Result<()> {
        self.mmap.read().flush()?;
        self.file.sync_data()?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::FIRST_DATA_PAGE;
    use tempfile::NamedTempFile;

    fn template() -> Header {
        Header::new(4, 4, 0, PAGE_SIZE as u32, FIRST_DATA_PAGE)
    }

    #[test]
    fn test_create_initializes_two_pages() {
        let temp_file = NamedTempFile::new().unwrap();
        let store = PageStore::open(temp_file.path(), &template()).unwrap();

        assert_eq!(store.page_count(), 2);
        let header = store.header().unwrap();
        assert!(header.is_valid());
        assert_eq!(header.insert_page, FIRST_DATA_PAGE);
        assert_eq!(store.read_page(FIRST_DATA_PAGE).unwrap().slot_count(), 0);
    }

    #[test]
    fn test_commit_writes_registered_pages() {
        let temp_file = NamedTempFile::new().unwrap();
        let store = PageStore::open(temp_file.path(), &template()).unwrap();

        let mut group = store.begin_group();
        let handle = group.register(store.lock_exclusive(1).unwrap()).unwrap();
        group.page_mut(handle).add_item(&[5; 32]).unwrap();
        group.commit().unwrap();

        assert_eq!(store.read_page(1).unwrap().item(0).unwrap(), &[5; 32]);
    }

    #[test]
    fn test_abort_leaves_store_untouched() {
        let temp_file = NamedTempFile::new().unwrap();
        let store = PageStore::open(temp_file.path(), &template()).unwrap();
        let before = store.snapshot();

        let mut group = store.begin_group();
        let handle = group.register(store.lock_exclusive(1).unwrap()).unwrap();
        group.page_mut(handle).add_item(&[5; 32]).unwrap();
        let appended = group.append_page().unwrap();
        let appended_id = group.page_id(appended);
        group.page_mut(handle).set_next_page(appended_id);
        group.abort();

        assert_eq!(store.snapshot(), before);
        assert_eq!(store.page_count(), 2);
    }

    #[test]
    fn test_append_grows_file_on_commit() {
        let temp_file = NamedTempFile::new().unwrap();
        let store = PageStore::open(temp_file.path(), &template()).unwrap();

        let mut group = store.begin_group();
        let first = group.append_page().unwrap();
        let second = group.append_page().unwrap();
        assert_eq!(group.page_id(first), 2);
        assert_eq!(group.page_id(second), 3);
        assert_eq!(store.page_count(), 2);
        group.commit().unwrap();

        assert_eq!(store.page_count(), 4);
    }

    #[test]
    fn test_locks_released_after_group() {
        let temp_file = NamedTempFile::new().unwrap();
        let store = PageStore::open(temp_file.path(), &template()).unwrap();

        {
            let mut group = store.begin_group();
            group.register(store.lock_exclusive(1).unwrap()).unwrap();
            assert!(store.try_lock_exclusive(1).unwrap().is_none());
        }

        assert!(store.try_lock_exclusive(1).unwrap().is_some());
    }

    #[test]
    fn test_lock_out_of_range_page() {
        let temp_file = NamedTempFile::new().unwrap();
        let store = PageStore::open(temp_file.path(), &template()).unwrap();
        assert!(store.lock_exclusive(99).is_err());
    }
}
