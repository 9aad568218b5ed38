//! Page store contract and the in-memory reference implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use opal_core::{Error, Result};
use parking_lot::RwLock;

use crate::page::{Page, PageId};

/// Shared-pin read guard. The pin is released when the guard drops, so
/// unwinding on error or interrupt releases every held pin.
pub struct PinnedPage {
    page: Arc<Page>,
    pins: Arc<AtomicUsize>,
}

impl std::ops::Deref for PinnedPage {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The host's paged, write-ahead-logged block store, reduced to the
/// operations the index crates need.
///
/// `write` is atomic per page and emits exactly one WAL record before the
/// page image is replaced; `read` returns a shared-pinned snapshot of the
/// current image. Mutation is read-modify-write on a private [`Page`] copy.
pub trait PageStore: Send + Sync {
    /// Append a zeroed page and return its id.
    fn allocate(&self) -> Result<PageId>;

    fn read(&self, id: PageId) -> Result<PinnedPage>;

    fn write(&self, id: PageId, page: &Page) -> Result<()>;

    fn page_count(&self) -> u32;
}

/// In-memory page store with pin and WAL-record accounting.
///
/// Stands in for the host block store in tests, demos and the build-time
/// disk-fallback path. Checksums are verified on read so corruption in a
/// stored image surfaces as [`Error::Page`].
pub struct MemoryPageStore {
    pages: RwLock<Vec<Arc<Page>>>,
    pins: Arc<AtomicUsize>,
    wal_records: AtomicU64,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(Vec::new()),
            pins: Arc::new(AtomicUsize::new(0)),
            wal_records: AtomicU64::new(0),
        }
    }

    /// Number of pages currently pinned by live [`PinnedPage`] guards.
    pub fn live_pins(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    /// WAL records emitted so far, one per `write`.
    pub fn wal_records(&self) -> u64 {
        self.wal_records.load(Ordering::Acquire)
    }
}

impl Default for MemoryPageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for MemoryPageStore {
    fn allocate(&self) -> Result<PageId> {
        let mut pages = self.pages.write();
        if pages.len() >= u32::MAX as usize - 1 {
            return Err(Error::Page("page id space exhausted".into()));
        }
        let id = pages.len() as PageId;
        let mut page = Page::new();
        page.seal();
        pages.push(Arc::new(page));
        tracing::trace!(page = id, "allocated page");
        Ok(id)
    }

    fn read(&self, id: PageId) -> Result<PinnedPage> {
        let pages = self.pages.read();
        let page = pages
            .get(id as usize)
            .cloned()
            .ok_or_else(|| Error::Page(format!("read of unallocated page {id}")))?;
        drop(pages);
        if !page.verify() {
            return Err(Error::Page(format!("checksum failure on page {id}")));
        }
        self.pins.fetch_add(1, Ordering::AcqRel);
        Ok(PinnedPage {
            page,
            pins: Arc::clone(&self.pins),
        })
    }

    fn write(&self, id: PageId, page: &Page) -> Result<()> {
        let mut sealed = page.clone();
        sealed.seal();
        let mut pages = self.pages.write();
        let slot = pages
            .get_mut(id as usize)
            .ok_or_else(|| Error::Page(format!("write to unallocated page {id}")))?;
        // WAL record precedes the in-place image replacement.
        self.wal_records.fetch_add(1, Ordering::AcqRel);
        *slot = Arc::new(sealed);
        Ok(())
    }

    fn page_count(&self) -> u32 {
        self.pages.read().len() as u32
    }
}
