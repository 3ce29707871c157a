//! Page allocation for thread TCBs and stacks.
//!
//! A thread owns exactly one page. The pool hands out zero-filled,
//! page-aligned blocks from the global allocator and keeps returned pages
//! on a free list for reuse.

use crate::config::PAGE_SIZE;
use crate::errors::MemoryError;
use alloc::alloc::{alloc, Layout};
use alloc::vec::Vec;
use core::ptr::NonNull;
use portable_atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// Start of the page containing `addr`.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Owning handle to one `PAGE_SIZE`-aligned block.
#[derive(Debug, PartialEq, Eq)]
pub struct Page {
    base: NonNull<u8>,
}

// SAFETY: a Page is the unique owner of its memory.
unsafe impl Send for Page {}

impl Page {
    /// Take ownership of the page at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must come from [`Page::into_raw`] of a page from the same
    /// allocator, and no other `Page` may own it.
    pub unsafe fn from_raw(addr: usize) -> Result<Self, MemoryError> {
        if addr % PAGE_SIZE != 0 {
            return Err(MemoryError::Misaligned(addr));
        }
        NonNull::new(addr as *mut u8)
            .map(|base| Self { base })
            .ok_or(MemoryError::Misaligned(addr))
    }

    /// Give up ownership and return the base address.
    pub fn into_raw(self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Lowest address of the page.
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the highest address: the initial stack pointer.
    pub fn top(&self) -> usize {
        self.base() + PAGE_SIZE
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn zero(&mut self) {
        unsafe { self.base.as_ptr().write_bytes(0, PAGE_SIZE) };
    }
}

/// Source of thread pages.
pub trait PageAllocator: Sync + 'static {
    /// A zero-filled page, or an error when none is available.
    fn alloc_page(&self) -> Result<Page, MemoryError>;

    /// Return a page obtained from [`alloc_page`](Self::alloc_page).
    fn free_page(&self, page: Page);
}

/// Counters of a [`PagePool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagePoolStats {
    /// Successful `alloc_page` calls
    pub allocated: usize,
    /// `free_page` calls
    pub freed: usize,
    /// Pages currently handed out
    pub in_use: usize,
    /// `alloc_page` calls refused for lack of memory
    pub exhausted: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    allocated: AtomicUsize,
    freed: AtomicUsize,
    in_use: AtomicUsize,
    exhausted: AtomicUsize,
}

/// Free-list page allocator backed by the global allocator.
pub struct PagePool {
    free: Mutex<Vec<Page>>,
    /// Maximum pages in use at once, `None` for unbounded
    limit: Option<usize>,
    stats: PoolCounters,
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}

impl PagePool {
    pub const fn new() -> Self {
        Self::build(None)
    }

    /// Pool that refuses allocations once `limit` pages are in use.
    pub const fn with_limit(limit: usize) -> Self {
        Self::build(Some(limit))
    }

    const fn build(limit: Option<usize>) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            limit,
            stats: PoolCounters {
                allocated: AtomicUsize::new(0),
                freed: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                exhausted: AtomicUsize::new(0),
            },
        }
    }

    pub fn stats(&self) -> PagePoolStats {
        PagePoolStats {
            allocated: self.stats.allocated.load(Ordering::Acquire),
            freed: self.stats.freed.load(Ordering::Acquire),
            in_use: self.stats.in_use.load(Ordering::Acquire),
            exhausted: self.stats.exhausted.load(Ordering::Acquire),
        }
    }

    /// Pages sitting on the free list.
    pub fn free_pages(&self) -> usize {
        self.free.lock().len()
    }

    fn refuse(&self) -> Result<Page, MemoryError> {
        self.stats.exhausted.fetch_add(1, Ordering::AcqRel);
        log::warn!("page pool exhausted ({} pages in use)", self.stats.in_use.load(Ordering::Acquire));
        Err(MemoryError::OutOfMemory)
    }

    fn allocate_new_page(&self) -> Option<Page> {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).ok()?;
        let memory = unsafe { alloc(layout) };
        NonNull::new(memory).map(|base| Page { base })
    }
}

impl PageAllocator for PagePool {
    fn alloc_page(&self) -> Result<Page, MemoryError> {
        if let Some(limit) = self.limit {
            if self.stats.in_use.load(Ordering::Acquire) >= limit {
                return self.refuse();
            }
        }

        let reused = self.free.lock().pop();
        let mut page = match reused.or_else(|| self.allocate_new_page()) {
            Some(page) => page,
            None => return self.refuse(),
        };
        page.zero();

        self.stats.allocated.fetch_add(1, Ordering::AcqRel);
        self.stats.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(page)
    }

    fn free_page(&self, page: Page) {
        self.free.lock().push(page);
        self.stats.freed.fetch_add(1, Ordering::AcqRel);
        self.stats.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_round_down() {
        assert_eq!(page_round_down(0x1234), 0x1000);
        assert_eq!(page_round_down(0x2000), 0x2000);
        assert_eq!(page_round_down(0x2fff), 0x2000);
    }

    #[test]
    fn test_pool_alloc_free() {
        let pool = PagePool::new();
        let page = pool.alloc_page().unwrap();

        assert_eq!(page.base() % PAGE_SIZE, 0);
        assert_eq!(page.top() - page.base(), PAGE_SIZE);

        pool.free_page(page);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.freed, 1);
        assert_eq!(stats.in_use, 0);
        assert_eq!(pool.free_pages(), 1);
    }

    #[test]
    fn test_pages_are_zeroed_on_reuse() {
        let pool = PagePool::new();
        let page = pool.alloc_page().unwrap();
        let base = page.base();
        unsafe { page.as_ptr().write_bytes(0xAB, PAGE_SIZE) };
        pool.free_page(page);

        let page = pool.alloc_page().unwrap();
        assert_eq!(page.base(), base);
        let bytes = unsafe { core::slice::from_raw_parts(page.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        pool.free_page(page);
    }

    #[test]
    fn test_pool_limit() {
        let pool = PagePool::with_limit(2);
        let a = pool.alloc_page().unwrap();
        let b = pool.alloc_page().unwrap();
        assert_eq!(pool.alloc_page(), Err(MemoryError::OutOfMemory));
        assert_eq!(pool.stats().exhausted, 1);

        pool.free_page(a);
        let c = pool.alloc_page().unwrap();
        pool.free_page(b);
        pool.free_page(c);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_raw_round_trip_rejects_misaligned() {
        let pool = PagePool::new();
        let page = pool.alloc_page().unwrap();
        let addr = page.into_raw();

        assert_eq!(
            unsafe { Page::from_raw(addr + 8) },
            Err(MemoryError::Misaligned(addr + 8))
        );

        let page = unsafe { Page::from_raw(addr) }.unwrap();
        assert_eq!(page.base(), addr);
        pool.free_page(page);
    }
}
