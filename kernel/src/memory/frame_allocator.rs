//! Physical page pool
//!
//! Free RAM lives on an address-ordered singly linked list of *chunks*,
//! each a run of consecutive page frames. The list header of a chunk is
//! stored in its first page, so the pool costs no memory of its own.
//! Allocation prefers an exact-fit chunk and otherwise splits the low end
//! off the smallest chunk that is strictly larger than the request.
//! Frees insert in address order; adjacent chunks are not coalesced.

use core::ptr;

use spin::Mutex;

use super::PAGE_SIZE;

/// Header written into the first page of every free chunk.
#[repr(C)]
struct ChunkHeader {
    next: *mut ChunkHeader,
    pages: usize,
}

/// An address-ordered free list of page chunks.
///
/// Public so unit tests can run a private pool over a synthetic arena;
/// the kernel uses the process-wide instance behind the module functions.
pub struct FreeList {
    head: *mut ChunkHeader,
}

// The raw pointers reference free physical pages owned exclusively by the
// list; access is serialized by the pool mutex.
unsafe impl Send for FreeList {}

impl FreeList {
    pub const fn new() -> Self {
        FreeList {
            head: ptr::null_mut(),
        }
    }

    /// Seed the pool with `[start, end)`. Both bounds are rounded inward
    /// to page boundaries.
    pub fn seed(&mut self, start: usize, end: usize) {
        let start = super::round_up(start, PAGE_SIZE);
        let end = super::round_down(end, PAGE_SIZE);
        assert!(start < end, "empty page pool");

        let chunk = start as *mut ChunkHeader;
        unsafe {
            (*chunk).next = ptr::null_mut();
            (*chunk).pages = (end - start) / PAGE_SIZE;
        }
        self.head = chunk;
    }

    /// Allocate `count` consecutive page frames.
    pub fn alloc_pages(&mut self, count: usize) -> Option<*mut u8> {
        if count == 0 {
            return None;
        }

        // Exact fit: unlink the whole chunk.
        let mut prev: *mut ChunkHeader = ptr::null_mut();
        let mut curr = self.head;
        while !curr.is_null() {
            unsafe {
                if (*curr).pages == count {
                    if prev.is_null() {
                        self.head = (*curr).next;
                    } else {
                        (*prev).next = (*curr).next;
                    }
                    return Some(curr as *mut u8);
                }
                prev = curr;
                curr = (*curr).next;
            }
        }

        // Otherwise split the smallest chunk strictly larger than the
        // request, handing out its low pages.
        let mut best: *mut ChunkHeader = ptr::null_mut();
        let mut best_prev: *mut ChunkHeader = ptr::null_mut();
        prev = ptr::null_mut();
        curr = self.head;
        while !curr.is_null() {
            unsafe {
                if (*curr).pages > count
                    && (best.is_null() || (*curr).pages < (*best).pages)
                {
                    best = curr;
                    best_prev = prev;
                }
                prev = curr;
                curr = (*curr).next;
            }
        }

        if best.is_null() {
            return None;
        }

        unsafe {
            let rest = (best as usize + count * PAGE_SIZE) as *mut ChunkHeader;
            (*rest).pages = (*best).pages - count;
            (*rest).next = (*best).next;
            if best_prev.is_null() {
                self.head = rest;
            } else {
                (*best_prev).next = rest;
            }
        }
        Some(best as *mut u8)
    }

    /// Return `count` pages starting at `page` to the pool.
    ///
    /// The caller must own the run, and `page` must be page-aligned.
    pub fn free_pages(&mut self, page: *mut u8, count: usize) {
        if page.is_null() || count == 0 {
            return;
        }
        assert_eq!(page as usize % PAGE_SIZE, 0, "unaligned page free");

        let chunk = page as *mut ChunkHeader;
        unsafe {
            (*chunk).pages = count;

            if self.head.is_null() || chunk < self.head {
                (*chunk).next = self.head;
                self.head = chunk;
                return;
            }

            let mut prev = self.head;
            let mut curr = (*self.head).next;
            while !curr.is_null() && curr < chunk {
                prev = curr;
                curr = (*curr).next;
            }
            (*prev).next = chunk;
            (*chunk).next = curr;
        }
    }

    pub fn free_page_count(&self) -> usize {
        let mut total = 0;
        let mut curr = self.head;
        while !curr.is_null() {
            unsafe {
                total += (*curr).pages;
                curr = (*curr).next;
            }
        }
        total
    }
}

static POOL: Mutex<FreeList> = Mutex::new(FreeList::new());

/// Seed the process-wide pool. Called once from `memory::init`.
pub fn init(start: usize, end: usize) {
    let mut pool = POOL.lock();
    pool.seed(start, end);
    log::info!(
        "Page pool: [{:#x}, {:#x}), {} pages",
        start,
        end,
        pool.free_page_count()
    );
}

/// Allocate a run of `count` consecutive frames, or `None` on exhaustion.
pub fn alloc_pages(count: usize) -> Option<*mut u8> {
    crate::arch::without_interrupts(|| POOL.lock().alloc_pages(count))
}

/// Return a run of frames to the pool.
pub fn free_pages(page: *mut u8, count: usize) {
    crate::arch::without_interrupts(|| POOL.lock().free_pages(page, count));
}

pub fn alloc_page() -> Option<*mut u8> {
    alloc_pages(1)
}

pub fn free_page(page: *mut u8) {
    free_pages(page, 1);
}

pub fn free_page_count() -> usize {
    crate::arch::without_interrupts(|| POOL.lock().free_page_count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// A page-aligned arena the tests can treat as physical memory.
    struct Arena {
        #[allow(dead_code)]
        storage: Vec<u8>,
        base: usize,
        pages: usize,
    }

    fn arena(pages: usize) -> Arena {
        let bytes = (pages + 1) * PAGE_SIZE;
        let storage = alloc::vec![0u8; bytes];
        let raw = storage.as_ptr() as usize;
        let base = super::super::round_up(raw, PAGE_SIZE);
        Arena {
            storage,
            base,
            pages,
        }
    }

    fn pool_over(a: &Arena) -> FreeList {
        let mut list = FreeList::new();
        list.seed(a.base, a.base + a.pages * PAGE_SIZE);
        list
    }

    #[test]
    fn test_seed_counts_pages() {
        let a = arena(16);
        let pool = pool_over(&a);
        assert_eq!(pool.free_page_count(), 16);
    }

    #[test]
    fn test_alloc_splits_low_pages() {
        let a = arena(16);
        let mut pool = pool_over(&a);

        let p = pool.alloc_pages(3).unwrap();
        assert_eq!(p as usize, a.base);
        assert_eq!(pool.free_page_count(), 13);

        // The remainder must start right after the allocated run.
        let q = pool.alloc_pages(1).unwrap();
        assert_eq!(q as usize, a.base + 3 * PAGE_SIZE);
    }

    #[test]
    fn test_exact_fit_preferred() {
        let a = arena(16);
        let mut pool = pool_over(&a);

        let p = pool.alloc_pages(4).unwrap();
        let _q = pool.alloc_pages(2).unwrap();
        pool.free_pages(p, 4);

        // The freed 4-page chunk is an exact fit for a 4-page request
        // even though a larger chunk also exists.
        let r = pool.alloc_pages(4).unwrap();
        assert_eq!(r, p);
    }

    #[test]
    fn test_free_keeps_address_order() {
        let a = arena(12);
        let mut pool = pool_over(&a);

        let p1 = pool.alloc_pages(2).unwrap();
        let p2 = pool.alloc_pages(2).unwrap();
        let p3 = pool.alloc_pages(2).unwrap();

        // Free out of order; the low chunk must come back first.
        pool.free_pages(p3, 2);
        pool.free_pages(p1, 2);
        pool.free_pages(p2, 2);

        let r = pool.alloc_pages(2).unwrap();
        assert_eq!(r, p1);
        assert_eq!(pool.free_page_count(), 10);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let a = arena(4);
        let mut pool = pool_over(&a);

        assert!(pool.alloc_pages(5).is_none());
        let _p = pool.alloc_pages(4).unwrap();
        assert!(pool.alloc_pages(1).is_none());
        assert_eq!(pool.free_page_count(), 0);
    }

    #[test]
    fn test_smallest_larger_chunk_is_split() {
        let a = arena(16);
        let mut pool = pool_over(&a);

        // Carve the arena into free chunks of 3 and 9 pages with a hole
        // between them.
        let p1 = pool.alloc_pages(3).unwrap();
        let hole = pool.alloc_pages(4).unwrap();
        pool.free_pages(p1, 3);
        // list now: [p1: 3 pages] -> [tail: 9 pages]; hole still allocated

        // A 2-page request should split the 3-page chunk, not the tail.
        let r = pool.alloc_pages(2).unwrap();
        assert_eq!(r, p1);
        pool.free_pages(hole, 4);
    }
}
