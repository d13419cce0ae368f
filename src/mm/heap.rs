//! # Heap-Backed Memory Manager
//!
//! Default [`MemoryManager`] for hosts without their own page allocator.
//! Regions are anonymous mappings, so the base address is stable and the
//! pages are demand-committed by the OS. Page-out is `madvise(DONTNEED)`:
//! the RAM is returned to the system immediately while the reservation and
//! base address survive. Contents are not preserved across page-out; the
//! cache marks such views as needing a re-read.
//!
//! A page budget bounds how much backing the cache may hold. A whole
//! view's worth is charged atomically at `reserve_region` time and
//! credited page by page at `free_page`, so reservation is the only
//! operation that can refuse and the per-page calls always succeed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use eyre::{bail, Result};
use memmap2::MmapMut;

use super::{MemoryManager, PageFrame, VaRegion};
use crate::config::{PAGES_PER_VIEW, PAGE_SIZE, VIEW_GRANULARITY};
use crate::error::CacheError;

#[derive(Debug)]
pub struct HeapMemory {
    max_pages: usize,
    pages_in_use: AtomicUsize,
    next_frame: AtomicU64,
}

impl HeapMemory {
    /// Creates a manager willing to hand out at most `max_pages` pages.
    pub fn new(max_pages: usize) -> Self {
        Self {
            max_pages,
            pages_in_use: AtomicUsize::new(0),
            next_frame: AtomicU64::new(1),
        }
    }

    /// Page budget currently charged.
    pub fn pages_in_use(&self) -> usize {
        self.pages_in_use.load(Ordering::Acquire)
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }
}

impl MemoryManager for HeapMemory {
    fn reserve_region(&self) -> Result<VaRegion> {
        // Charge the whole view up front. Reservation is the one step
        // allowed to refuse; once it succeeds the per-page calls below
        // must not fail, however many creators race.
        let charged = self
            .pages_in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used + PAGES_PER_VIEW <= self.max_pages).then_some(used + PAGES_PER_VIEW)
            });
        if let Err(used) = charged {
            bail!(CacheError::OutOfResources {
                requested_pages: PAGES_PER_VIEW,
                available_pages: self.max_pages.saturating_sub(used),
            });
        }

        match MmapMut::map_anon(VIEW_GRANULARITY) {
            Ok(mmap) => Ok(VaRegion::new(mmap)),
            Err(err) => {
                self.pages_in_use
                    .fetch_sub(PAGES_PER_VIEW, Ordering::AcqRel);
                Err(eyre::eyre!("failed to reserve view region: {}", err))
            }
        }
    }

    fn alloc_page(&self) -> Result<PageFrame> {
        // Already paid for by the owning reservation.
        Ok(PageFrame(self.next_frame.fetch_add(1, Ordering::Relaxed)))
    }

    fn map_page(&self, region: &mut VaRegion, index: usize, frame: PageFrame) {
        debug_assert!(region.frames[index].is_none(), "page mapped twice");
        region.frames[index] = Some(frame);
        // Touch the page so the commit happens here rather than at first
        // caller access.
        // SAFETY: page_ptr stays inside the region's mapping, which is
        // writable and lives for at least as long as `region`.
        unsafe { region.page_ptr(index).write(0) };
    }

    fn page_out(&self, region: &VaRegion, index: usize) {
        debug_assert!(region.frames[index].is_some(), "page-out of unmapped page");
        #[cfg(unix)]
        // SAFETY: the address range is one whole page inside the region's
        // anonymous mapping. MADV_DONTNEED on an anonymous mapping drops
        // the backing RAM and leaves a zero-fill reservation behind, which
        // is exactly the page-out contract.
        unsafe {
            libc::madvise(
                region.page_ptr(index) as *mut libc::c_void,
                PAGE_SIZE,
                libc::MADV_DONTNEED,
            );
        }
        #[cfg(not(unix))]
        let _ = (region, index);
    }

    fn free_page(&self, region: &mut VaRegion, index: usize) {
        let frame = region.frames[index].take();
        debug_assert!(frame.is_some(), "double free of view page");
        if frame.is_some() {
            self.pages_in_use.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn release_region(&self, region: VaRegion) {
        debug_assert!(
            region.frames.iter().all(|f| f.is_none()),
            "region released with pages still mapped"
        );
        drop(region);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_populate_one_view() {
        let mm = HeapMemory::new(PAGES_PER_VIEW);
        let mut region = mm.reserve_region().unwrap();

        for i in 0..PAGES_PER_VIEW {
            let frame = mm.alloc_page().unwrap();
            mm.map_page(&mut region, i, frame);
        }
        assert_eq!(mm.pages_in_use(), PAGES_PER_VIEW);
        assert!(!region.base().is_null());

        for i in 0..PAGES_PER_VIEW {
            mm.free_page(&mut region, i);
        }
        mm.release_region(region);
        assert_eq!(mm.pages_in_use(), 0);
    }

    #[test]
    fn reserve_refuses_when_budget_cannot_fit_a_view() {
        let mm = HeapMemory::new(PAGES_PER_VIEW + 1);
        let mut first = mm.reserve_region().unwrap();
        for i in 0..PAGES_PER_VIEW {
            let frame = mm.alloc_page().unwrap();
            mm.map_page(&mut first, i, frame);
        }

        let err = mm.reserve_region().unwrap_err();
        assert!(err.downcast_ref::<crate::error::CacheError>().is_some());

        for i in 0..PAGES_PER_VIEW {
            mm.free_page(&mut first, i);
        }
        mm.release_region(first);
    }

    #[test]
    fn page_out_keeps_the_reservation() {
        let mm = HeapMemory::new(PAGES_PER_VIEW);
        let mut region = mm.reserve_region().unwrap();
        for i in 0..PAGES_PER_VIEW {
            let frame = mm.alloc_page().unwrap();
            mm.map_page(&mut region, i, frame);
        }

        let base = region.base();
        mm.page_out(&region, 0);
        assert_eq!(region.base(), base);
        assert!(region.frame(0).is_some());

        for i in 0..PAGES_PER_VIEW {
            mm.free_page(&mut region, i);
        }
        mm.release_region(region);
    }
}
