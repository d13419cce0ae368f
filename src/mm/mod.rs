//! # Memory Manager Interface
//!
//! The cache never allocates view memory directly. Everything flows through
//! the [`MemoryManager`] capability: reserve an address region for a view,
//! populate it page by page, page it out under pressure, and give it back.
//! This is one of the two polymorphism seams of the crate (the other is
//! [`crate::cache::CacheBackend`]); a host with its own page allocator
//! implements this trait, everyone else uses [`HeapMemory`].
//!
//! ## Contract
//!
//! - `reserve_region` returns a region whose base address is stable until
//!   `release_region`. Failure is reportable (the caller surfaces it as an
//!   out-of-resources error).
//! - `alloc_page` hands out one page of backing for the cache consumer
//!   class. Once a region is reserved the allocator is expected to satisfy
//!   the per-page requests for it; a refusal mid-population is treated as a
//!   broken contract and panics.
//! - `page_out` releases the RAM behind one page while keeping the mapping
//!   reservation intact. The page's contents are not preserved.
//! - `free_page` returns a page to the allocator; `release_region` returns
//!   the address space.

mod heap;

pub use heap::HeapMemory;

use eyre::Result;
use memmap2::MmapMut;

use crate::config::{PAGES_PER_VIEW, PAGE_SIZE, VIEW_GRANULARITY};

/// Handle for one allocated physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFrame(pub u64);

/// A reserved, view-sized virtual address region.
///
/// Owns the anonymous mapping and the per-page frame slots. The base
/// address stays valid for the lifetime of the region, which is exactly
/// the lifetime of the owning view.
#[derive(Debug)]
pub struct VaRegion {
    mmap: MmapMut,
    frames: [Option<PageFrame>; PAGES_PER_VIEW],
}

impl VaRegion {
    fn new(mmap: MmapMut) -> Self {
        Self {
            mmap,
            frames: [None; PAGES_PER_VIEW],
        }
    }

    pub fn base(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn len(&self) -> usize {
        VIEW_GRANULARITY
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn frame(&self, index: usize) -> Option<PageFrame> {
        self.frames[index]
    }

    fn page_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < PAGES_PER_VIEW);
        // SAFETY: index is bounded by PAGES_PER_VIEW, so the offset stays
        // inside the VIEW_GRANULARITY-sized mapping.
        unsafe { self.base().add(index * PAGE_SIZE) }
    }
}

pub trait MemoryManager: Send + Sync {
    /// Reserves a `VIEW_GRANULARITY`-sized region with a stable base.
    fn reserve_region(&self) -> Result<VaRegion>;

    /// Allocates one page of cache backing.
    fn alloc_page(&self) -> Result<PageFrame>;

    /// Installs `frame` behind page `index` of `region`.
    fn map_page(&self, region: &mut VaRegion, index: usize, frame: PageFrame);

    /// Releases the RAM behind page `index`, keeping the reservation.
    fn page_out(&self, region: &VaRegion, index: usize);

    /// Returns the page behind `index` to the allocator.
    fn free_page(&self, region: &mut VaRegion, index: usize);

    /// Returns the whole region's address space.
    fn release_region(&self, region: VaRegion);
}
