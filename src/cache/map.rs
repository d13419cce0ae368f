//! # Per-File Cache Maps
//!
//! A [`CacheMap`] associates one file with its set of views. The view
//! index is ordered by file offset and holds at most one view per aligned
//! bucket; the uniqueness guarantee survives concurrent misses because a
//! freshly mapped view is only published after a re-scan under the locks
//! (the mapping itself is built with no locks held, so two racers can both
//! build one, and the loser unmaps its copy).
//!
//! Handles layer on top: each open of the file takes a [`CacheHandle`],
//! which owns a private read-ahead block and one unit of the map's open
//! count. The last handle to go away tears the whole map down, flushing
//! every dirty view first.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use eyre::{bail, Result};
use parking_lot::Mutex;

use super::backend::CacheBackend;
use super::flush;
use super::root::RootShared;
use super::view::{View, ViewGuard, ViewRef};
use crate::config::{view_contains, view_round_down, PAGE_SIZE, VIEW_GRANULARITY};
use crate::error::CacheError;

/// Opaque identity of a cached file. The cache never inspects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u64);

#[derive(Debug, Clone, Copy)]
pub struct FileSizes {
    /// Committed length of the file.
    pub file_size: i64,
    /// Length of the cacheable range. May exceed `file_size` when the
    /// file's allocation does.
    pub section_size: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions {
    /// The pin layer will be used on this file. Recorded for that layer;
    /// the cache itself only reads pin counts as a liveness signal.
    pub pin_access: bool,
    /// Lazy writeback skips this file; only explicit flushes persist it.
    pub temporary: bool,
}

/// Per-handle read-ahead block. The cache binds its lifecycle to the
/// handle and links it into the owning map; the read-ahead layer owns its
/// meaning.
#[derive(Debug)]
pub struct PrivateCacheMap {
    read_ahead_mask: usize,
    window: Mutex<ReadAheadWindow>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ReadAheadWindow {
    offsets: [i64; 2],
    lengths: [usize; 2],
}

impl PrivateCacheMap {
    pub(crate) fn new() -> Self {
        Self {
            read_ahead_mask: PAGE_SIZE - 1,
            window: Mutex::new(ReadAheadWindow::default()),
        }
    }

    pub fn read_ahead_mask(&self) -> usize {
        self.read_ahead_mask
    }

    pub fn record_window(&self, slot: usize, offset: i64, length: usize) {
        let mut window = self.window.lock();
        window.offsets[slot] = offset;
        window.lengths[slot] = length;
    }

    pub fn window(&self, slot: usize) -> (i64, usize) {
        let window = self.window.lock();
        (window.offsets[slot], window.lengths[slot])
    }
}

pub(crate) struct MapInner {
    pub(crate) views: BTreeMap<i64, ViewRef>,
    pub(crate) dirty_pages: usize,
    pub(crate) private_maps: Vec<Arc<PrivateCacheMap>>,
}

pub struct CacheMap {
    file_id: FileId,
    backend: Arc<dyn CacheBackend>,
    file_size: i64,
    section_size: i64,
    pin_access: bool,
    temporary: bool,
    trace: Arc<AtomicBool>,
    pub(crate) open_count: AtomicU32,
    pub(crate) inner: Mutex<MapInner>,
    root: Weak<RootShared>,
}

/// One view's state as seen by the tracing surface.
#[derive(Debug, Clone, Copy)]
pub struct ViewTrace {
    pub file_offset: i64,
    pub ref_count: u32,
    pub dirty: bool,
    pub mapped_count: u32,
    pub paged_out: bool,
    /// Reference transitions observed while tracing was enabled.
    pub transitions: u64,
}

impl CacheMap {
    pub(crate) fn new(
        file_id: FileId,
        sizes: FileSizes,
        options: CacheOptions,
        backend: Arc<dyn CacheBackend>,
        root: Weak<RootShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            file_id,
            backend,
            file_size: sizes.file_size,
            section_size: sizes.section_size,
            pin_access: options.pin_access,
            temporary: options.temporary,
            trace: Arc::new(AtomicBool::new(false)),
            open_count: AtomicU32::new(0),
            inner: Mutex::new(MapInner {
                views: BTreeMap::new(),
                dirty_pages: 0,
                private_maps: Vec::new(),
            }),
            root,
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn file_size(&self) -> i64 {
        self.file_size
    }

    pub fn section_size(&self) -> i64 {
        self.section_size
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn pin_access(&self) -> bool {
        self.pin_access
    }

    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    pub(crate) fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub(crate) fn root(&self) -> Arc<RootShared> {
        // INVARIANT: maps are owned by the root's registry; an operation
        // on a map implies the root is alive.
        self.root.upgrade().expect("cache map outlived its root")
    }

    /// Enables or disables reference tracing for this map's views.
    pub fn set_trace(&self, enabled: bool) {
        self.trace.store(enabled, Ordering::Release);
    }

    pub(crate) fn trace_flag(&self) -> Arc<AtomicBool> {
        self.trace.clone()
    }

    /// Snapshot of every view's counters, for diagnosis.
    pub fn trace_snapshot(&self) -> Vec<ViewTrace> {
        let inner = self.inner.lock();
        inner
            .views
            .values()
            .map(|view| ViewTrace {
                file_offset: view.file_offset(),
                ref_count: view.ref_count(),
                dirty: view.is_dirty(),
                mapped_count: view.mapped_count(),
                paged_out: view.is_paged_out(),
                transitions: view.trace_transitions(),
            })
            .collect()
    }

    pub(crate) fn dirty_pages(&self) -> usize {
        self.inner.lock().dirty_pages
    }

    pub(crate) fn attach_private(&self, private: Arc<PrivateCacheMap>) {
        self.inner.lock().private_maps.push(private);
    }

    fn detach_private(&self, private: &Arc<PrivateCacheMap>) {
        let mut inner = self.inner.lock();
        inner.private_maps.retain(|p| !Arc::ptr_eq(p, private));
    }

    /// Finds the view containing `offset`, taking a reference on it.
    pub(crate) fn lookup(&self, offset: i64) -> Option<ViewRef> {
        let inner = self.inner.lock();
        let view = lookup_locked(&inner, offset)?.clone();
        view.inc_ref();
        Some(view)
    }

    fn create_view(self: &Arc<Self>, offset: i64) -> Result<ViewRef> {
        if offset < 0 || offset >= self.section_size {
            bail!(CacheError::InvalidParameter(
                "view offset outside the cached section"
            ));
        }

        let root = self.root();
        let aligned = view_round_down(offset);

        // Build the mapping with no locks held; page allocation may block.
        let view = View::new_mapped(
            aligned,
            Arc::downgrade(self),
            root.memory(),
            self.trace_flag(),
        )?;

        // A racing miss may have published a view for this bucket while we
        // were mapping. Re-scan before publishing; the loser's copy dies.
        let mut lists = root.lists.lock();
        let mut inner = self.inner.lock();
        if let Some(existing) = lookup_locked(&inner, offset) {
            let existing = existing.clone();
            existing.inc_ref();
            drop(inner);
            drop(lists);
            let refs = view.dec_ref();
            debug_assert_eq!(refs, 0, "unpublished view had extra references");
            return Ok(existing);
        }

        inner.views.insert(aligned, view.clone());
        drop(inner);
        lists.lru_push_tail(&view);
        // One more for the caller before the list lock goes down, so a
        // racing trim cannot reap the view between publication and return.
        // Final count 2: index membership plus the caller's hold.
        view.inc_ref();
        drop(lists);

        Ok(view)
    }

    /// Resolves `offset` to its view, creating and mapping one on a miss.
    /// The returned guard carries the reference; contents are only
    /// trustworthy when the guard reports valid.
    pub fn get_view(self: &Arc<Self>, offset: i64) -> Result<ViewGuard> {
        let view = match self.lookup(offset) {
            Some(view) => view,
            None => self.create_view(offset)?,
        };

        let root = self.root();
        root.lists.lock().lru_move_tail(&view);

        Ok(ViewGuard::new(self.clone(), view))
    }

    /// [`CacheMap::get_view`] for callers that work in whole views. The
    /// offset must be granularity-aligned; anything else is a caller bug.
    pub fn request_view(self: &Arc<Self>, offset: i64) -> Result<ViewGuard> {
        assert!(
            offset % VIEW_GRANULARITY as i64 == 0,
            "request_view offset {:#x} is not aligned to {:#x}",
            offset,
            VIEW_GRANULARITY
        );
        self.get_view(offset)
    }

    /// Records the teardown of one external mapping of the view at
    /// `offset`, then releases as usual.
    pub fn unmap_view(self: &Arc<Self>, offset: i64, now_dirty: bool) -> Result<()> {
        let Some(view) = self.lookup(offset) else {
            bail!(CacheError::ViewNotFound {
                file_id: self.file_id,
                file_offset: offset,
            });
        };

        if view.dec_mapped() == 1 {
            view.dec_ref();
        }

        let valid = view.is_valid();
        release_view(self, &view, valid, now_dirty, false);
        Ok(())
    }

    /// Marks the view containing `offset` dirty. The caller vouches that
    /// the view exists; a miss here means its bookkeeping is corrupt.
    pub fn mark_dirty_by_offset(self: &Arc<Self>, offset: i64) {
        let view = self
            .lookup(offset)
            .unwrap_or_else(|| panic!("no view to dirty at offset {:#x}", offset));
        let valid = view.is_valid();
        release_view(self, &view, valid, true, false);
    }
}

impl std::fmt::Debug for CacheMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMap")
            .field("file_id", &self.file_id)
            .field("file_size", &self.file_size)
            .field("section_size", &self.section_size)
            .field("open_count", &self.open_count())
            .field("views", &self.inner.lock().views.len())
            .finish()
    }
}

fn lookup_locked<'a>(inner: &'a MapInner, offset: i64) -> Option<&'a ViewRef> {
    let (_, view) = inner.views.range(..=offset).next_back()?;
    view_contains(view.file_offset(), offset).then_some(view)
}

/// Returns a hold on `view`, folding in what the caller learned: validity,
/// whether it dirtied the contents, and whether it created a new external
/// mapping.
pub(crate) fn release_view(
    map: &Arc<CacheMap>,
    view: &ViewRef,
    valid: bool,
    dirty: bool,
    mapped_inc: bool,
) {
    view.set_valid(valid);

    if dirty && !view.is_dirty() {
        flush::mark_dirty_view(&map.root(), map, view);
    }

    if mapped_inc && view.inc_mapped() == 0 {
        view.inc_ref();
    }

    let refs = view.dec_ref();
    assert!(refs >= 1, "release dropped a view's index reference");
}

/// One open of a cached file.
///
/// Owns a private read-ahead block and one unit of the map's open count.
/// Explicit [`CacheHandle::release`] and plain drop are equivalent; the
/// last one out triggers map teardown.
pub struct CacheHandle {
    map: Arc<CacheMap>,
    private: Option<Arc<PrivateCacheMap>>,
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle").finish_non_exhaustive()
    }
}

impl CacheHandle {
    pub(crate) fn new(map: Arc<CacheMap>, private: Arc<PrivateCacheMap>) -> Self {
        Self {
            map,
            private: Some(private),
        }
    }

    pub fn map(&self) -> &Arc<CacheMap> {
        &self.map
    }

    pub fn private_map(&self) -> &Arc<PrivateCacheMap> {
        // INVARIANT: `private` is only taken during release/drop.
        self.private.as_ref().expect("handle already released")
    }

    /// Closes this handle. The private block is detached first, then the
    /// open count drops; at zero the map is flushed and torn down.
    pub fn release(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(private) = self.private.take() {
            self.map.detach_private(&private);
            let root = self.map.root();
            root.dereference(&self.map);
        }
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.detach();
    }
}
