//! # Views and the Reference State Machine
//!
//! A [`View`] is one granularity-sized slice of a file held at a stable
//! address. Its lifetime is driven entirely by `ref_count`:
//!
//! ```text
//! create (ref=1, unpublished)
//!    │ publish: map index insert + LRU tail, +1 for the caller (ref=2)
//!    ▼
//! published ──get──▶ handed out (ref≥2) ──release──▶ published (ref≥1)
//!    │                                                 │
//!    │  mark-dirty holds +1 while on the dirty list    │
//!    ▼                                                 ▼
//! trim unlinks (index ref dropped) ──ref hits 0──▶ freed
//! ```
//!
//! Every hold is an explicit `ref_count` increment; there are no hidden
//! owners. The decrement that reaches zero runs the free path inline:
//! assert the free preconditions, poison the mapping, return the pages and
//! the region to the memory manager. `mapped_count` tracks external
//! mappings of the view into other address spaces; the first mapping takes
//! one reference and the last unmapping returns it.
//!
//! [`ViewGuard`] is the caller-facing hold. It releases on drop, so a
//! caller that bails early cannot strand a reference.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use eyre::Result;
use parking_lot::Mutex;

use super::map::{release_view, CacheMap};
use crate::config::{PAGES_PER_VIEW, VIEW_GRANULARITY, VIEW_POISON};
use crate::mm::{MemoryManager, VaRegion};

pub(crate) type ViewRef = Arc<View>;

pub struct View {
    file_offset: i64,
    base: *mut u8,
    region: Mutex<Option<VaRegion>>,
    valid: AtomicBool,
    dirty: AtomicBool,
    paged_out: AtomicBool,
    mapped_count: AtomicU32,
    pin_count: AtomicU32,
    ref_count: AtomicU32,
    lru_key: AtomicU64,
    dirty_key: AtomicU64,
    map: Weak<CacheMap>,
    mm: Arc<dyn MemoryManager>,
    trace: Arc<AtomicBool>,
    transitions: AtomicU64,
}

// SAFETY: `base` points into the anonymous mapping owned by `region` and
// is only dereferenced while a reference is held, which keeps the mapping
// alive. All flag and count mutation goes through atomics or the region
// mutex.
unsafe impl Send for View {}
unsafe impl Sync for View {}

impl View {
    /// Allocates a view and maps its backing pages. The result carries the
    /// creation reference (ref=1) and is not yet published anywhere.
    pub(crate) fn new_mapped(
        file_offset: i64,
        map: Weak<CacheMap>,
        mm: Arc<dyn MemoryManager>,
        trace: Arc<AtomicBool>,
    ) -> Result<ViewRef> {
        let mut region = mm.reserve_region()?;
        for i in 0..PAGES_PER_VIEW {
            // Reservation succeeded, so the per-page contract holds; a
            // refusal here is allocator corruption, not a resource error.
            let frame = mm
                .alloc_page()
                .expect("page allocator refused a page for a reserved region");
            mm.map_page(&mut region, i, frame);
        }
        let base = region.base();

        Ok(Arc::new(View {
            file_offset,
            base,
            region: Mutex::new(Some(region)),
            valid: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            paged_out: AtomicBool::new(false),
            mapped_count: AtomicU32::new(0),
            pin_count: AtomicU32::new(0),
            ref_count: AtomicU32::new(1),
            lru_key: AtomicU64::new(0),
            dirty_key: AtomicU64::new(0),
            map,
            mm,
            trace,
            transitions: AtomicU64::new(0),
        }))
    }

    pub fn file_offset(&self) -> i64 {
        self.file_offset
    }

    pub fn base_addr(&self) -> NonNull<u8> {
        // INVARIANT: the mapping exists from new_mapped until free, and
        // anonymous mappings are never at address zero.
        NonNull::new(self.base).expect("view mapping has a null base")
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
        if valid {
            self.paged_out.store(false, Ordering::Release);
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub fn is_paged_out(&self) -> bool {
        self.paged_out.load(Ordering::Acquire)
    }

    pub fn mapped_count(&self) -> u32 {
        self.mapped_count.load(Ordering::Acquire)
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn owner(&self) -> Arc<CacheMap> {
        // INVARIANT: teardown drains every view before the map is dropped,
        // so a reachable view always has a live owner.
        self.map.upgrade().expect("view outlived its cache map")
    }

    /// Increments `mapped_count`, returning the previous value.
    pub(crate) fn inc_mapped(&self) -> u32 {
        self.mapped_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements `mapped_count`, returning the previous value.
    pub(crate) fn dec_mapped(&self) -> u32 {
        let prev = self.mapped_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "unmap of a view with no outstanding mappings");
        prev
    }

    /// Forces `mapped_count` to zero, returning the previous value.
    pub(crate) fn clear_mapped(&self) -> u32 {
        self.mapped_count.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn set_lru_key(&self, key: u64) {
        self.lru_key.store(key, Ordering::Release);
    }

    pub(crate) fn take_lru_key(&self) -> u64 {
        self.lru_key.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn set_dirty_key(&self, key: u64) {
        self.dirty_key.store(key, Ordering::Release);
    }

    pub(crate) fn take_dirty_key(&self) -> u64 {
        self.dirty_key.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn trace_transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Takes one reference on the view. Returns the new count.
    pub(crate) fn inc_ref(&self) -> u32 {
        let refs = self.ref_count.fetch_add(1, Ordering::AcqRel) + 1;
        if self.trace.load(Ordering::Relaxed) {
            self.transitions.fetch_add(1, Ordering::Relaxed);
        }
        refs
    }

    /// Drops one reference. The transition to zero is the commit point of
    /// destruction: the free path runs inline before this returns.
    pub(crate) fn dec_ref(&self) -> u32 {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "view reference count underflow");
        let refs = prev - 1;
        assert!(
            !(refs == 0 && self.is_dirty()),
            "dirty view dropped its last reference"
        );
        if self.trace.load(Ordering::Relaxed) {
            self.transitions.fetch_add(1, Ordering::Relaxed);
        }
        if refs == 0 {
            self.free();
        }
        refs
    }

    /// Releases the RAM behind every page while keeping the region and its
    /// base address. Contents are lost, so the view stops being valid and
    /// the next consumer re-reads it.
    pub(crate) fn page_out(&self) {
        let region = self.region.lock();
        let region = region.as_ref().expect("page-out of a freed view");
        for i in 0..PAGES_PER_VIEW {
            self.mm.page_out(region, i);
        }
        self.valid.store(false, Ordering::Release);
        self.paged_out.store(true, Ordering::Release);
    }

    fn free(&self) {
        assert_eq!(self.pin_count(), 0, "freeing a pinned view");
        assert_eq!(self.mapped_count(), 0, "freeing a mapped view");
        assert!(!self.is_dirty(), "freeing a dirty view");
        assert_eq!(
            self.lru_key.load(Ordering::Acquire),
            0,
            "freeing a view still on the reuse list"
        );
        assert_eq!(
            self.dirty_key.load(Ordering::Acquire),
            0,
            "freeing a view still on the dirty list"
        );

        let mut slot = self.region.lock();
        let mut region = slot.take().expect("view freed twice");
        // SAFETY: the region is still mapped and writable for its whole
        // length; poisoning it makes stale pointers into the dead view
        // obvious.
        unsafe { std::ptr::write_bytes(region.base(), VIEW_POISON, VIEW_GRANULARITY) };
        for i in 0..PAGES_PER_VIEW {
            self.mm.free_page(&mut region, i);
        }
        self.mm.release_region(region);
    }

    /// The view's bytes.
    ///
    /// # Safety
    ///
    /// The caller must hold a reference (the mapping is torn down when the
    /// count reaches zero) and must not hold a mutable slice of the same
    /// view anywhere else.
    pub(crate) unsafe fn slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.base, VIEW_GRANULARITY)
    }

    /// The view's bytes, writable.
    ///
    /// # Safety
    ///
    /// Same liveness requirement as [`View::slice`], plus exclusivity: no
    /// other slice of this view may be live. [`ViewGuard::data_mut`]
    /// enforces the latter per guard via `&mut self`; sharing one view
    /// across guards leaves the exclusivity to the caller.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base, VIEW_GRANULARITY)
    }
}

impl Drop for View {
    fn drop(&mut self) {
        // Backstop for a root dropped without teardown: give the pages
        // back so the memory manager's accounting stays balanced.
        if let Some(mut region) = self.region.get_mut().take() {
            for i in 0..PAGES_PER_VIEW {
                if region.frame(i).is_some() {
                    self.mm.free_page(&mut region, i);
                }
            }
            self.mm.release_region(region);
        }
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("file_offset", &self.file_offset)
            .field("refs", &self.ref_count())
            .field("valid", &self.is_valid())
            .field("dirty", &self.is_dirty())
            .field("mapped", &self.mapped_count())
            .finish()
    }
}

/// A caller's hold on a view.
///
/// Created by `get_view`/`request_view`. Consumed by [`ViewGuard::release`]
/// (or a mapped-release variant); dropping the guard releases with the
/// view's current validity and no dirtying, so early returns stay balanced.
impl std::fmt::Debug for ViewGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewGuard").finish_non_exhaustive()
    }
}

pub struct ViewGuard {
    map: Arc<CacheMap>,
    view: Option<ViewRef>,
}

impl ViewGuard {
    pub(crate) fn new(map: Arc<CacheMap>, view: ViewRef) -> Self {
        Self {
            map,
            view: Some(view),
        }
    }

    fn view(&self) -> &ViewRef {
        // INVARIANT: `view` is only taken by release/drop, which consume
        // the guard.
        self.view.as_ref().expect("guard already released")
    }

    /// Offset of the view's first byte, aligned to the granularity. May be
    /// below the offset the guard was requested for.
    pub fn file_offset(&self) -> i64 {
        self.view().file_offset()
    }

    pub fn base_addr(&self) -> NonNull<u8> {
        self.view().base_addr()
    }

    /// Whether the view's contents reflect committed file data. A caller
    /// seeing `false` reads the range from the file before using it.
    pub fn is_valid(&self) -> bool {
        self.view().is_valid()
    }

    pub fn is_dirty(&self) -> bool {
        self.view().is_dirty()
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: the guard holds a reference, keeping the mapping alive.
        // Exclusivity against writers of the same view is the caller's
        // contract, as with any shared file mapping.
        unsafe { self.view().slice() }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: liveness as in `data`. `&mut self` makes this guard's
        // accesses exclusive; concurrent guards to the same view must not
        // overlap mutably, which mirrors the underlying mapping semantics.
        unsafe { self.view().slice_mut() }
    }

    /// Returns the hold, recording what the caller now knows: whether the
    /// contents are a faithful copy of file data and whether the caller
    /// dirtied them.
    pub fn release(mut self, valid: bool, dirty: bool) {
        let view = self.view.take().expect("guard already released");
        release_view(&self.map, &view, valid, dirty, false);
    }

    /// Like [`ViewGuard::release`], additionally recording one new
    /// external mapping of the view.
    pub fn release_mapped(mut self, valid: bool, dirty: bool) {
        let view = self.view.take().expect("guard already released");
        release_view(&self.map, &view, valid, dirty, true);
    }
}

impl Drop for ViewGuard {
    fn drop(&mut self) {
        if let Some(view) = self.view.take() {
            let valid = view.is_valid();
            release_view(&self.map, &view, valid, false, false);
        }
    }
}
