//! # Cache Root
//!
//! [`CacheRoot`] is the whole subsystem as one explicit value: the
//! registry of per-file maps, the global reuse (LRU) and dirty lists, the
//! dirty-page accounting, and the lazy-writer wakeup. Building one is
//! subsystem init; dropping the last clone is subsystem teardown.
//!
//! ## Lists
//!
//! Both global lists are ordered by a monotonically increasing sequence
//! number handed out under the list lock. A view stores its current key in
//! each list (zero meaning "not linked"), which makes unlink O(log n) from
//! anywhere and keeps membership changes atomic with the reference-count
//! mutations they accompany: dirty-list membership owns exactly one
//! reference, reuse-list membership owns none.
//!
//! ## Locking
//!
//! One mutex guards the registry and both lists. The per-map lock nests
//! inside it, and neither is ever held across a backend or memory-manager
//! callout. Counter reads without the lock are advisory and feed only the
//! stats surface.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;

use super::backend::CacheBackend;
use super::flush;
use super::map::{CacheHandle, CacheMap, CacheOptions, FileId, FileSizes, PrivateCacheMap};
use super::trim;
use super::view::ViewRef;
use crate::config::{PAGES_PER_VIEW, PAGE_SIZE, VIEW_GRANULARITY};
use crate::error::CacheError;
use crate::mm::{HeapMemory, MemoryManager};

pub(crate) struct RootLists {
    seq: u64,
    pub(crate) lru: std::collections::BTreeMap<u64, ViewRef>,
    pub(crate) dirty: std::collections::BTreeMap<u64, ViewRef>,
    pub(crate) maps: HashMap<FileId, Arc<CacheMap>>,
}

impl RootLists {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub(crate) fn lru_push_tail(&mut self, view: &ViewRef) {
        debug_assert_eq!(view.take_lru_key(), 0, "view already on the reuse list");
        let key = self.next_seq();
        view.set_lru_key(key);
        self.lru.insert(key, view.clone());
    }

    pub(crate) fn lru_remove(&mut self, view: &ViewRef) {
        let key = view.take_lru_key();
        if key != 0 {
            self.lru.remove(&key);
        }
    }

    pub(crate) fn lru_move_tail(&mut self, view: &ViewRef) {
        self.lru_remove(view);
        self.lru_push_tail(view);
    }

    pub(crate) fn dirty_push_tail(&mut self, view: &ViewRef) {
        debug_assert_eq!(view.take_dirty_key(), 0, "view already on the dirty list");
        let key = self.next_seq();
        view.set_dirty_key(key);
        self.dirty.insert(key, view.clone());
    }

    pub(crate) fn dirty_remove(&mut self, view: &ViewRef) {
        let key = view.take_dirty_key();
        debug_assert!(key != 0, "view not on the dirty list");
        if key != 0 {
            self.dirty.remove(&key);
        }
    }
}

pub(crate) struct RootShared {
    pub(crate) lists: Mutex<RootLists>,
    pub(crate) total_dirty_pages: AtomicUsize,
    dirty_page_threshold: AtomicUsize,
    pub(crate) leaked_views: AtomicUsize,
    mm: Arc<dyn MemoryManager>,
    lazy_pending: Mutex<bool>,
    lazy_cv: Condvar,
    lazy_scan_active: AtomicBool,
}

impl RootShared {
    pub(crate) fn memory(&self) -> Arc<dyn MemoryManager> {
        self.mm.clone()
    }

    /// Wakes the lazy writer unless a scan is already running. Called
    /// after mark-dirty, with no cache locks held.
    pub(crate) fn schedule_lazy_scan(&self) {
        if self.lazy_scan_active.load(Ordering::Acquire) {
            return;
        }
        let mut pending = self.lazy_pending.lock();
        *pending = true;
        self.lazy_cv.notify_one();
    }

    /// Drops one open count; at zero the map is flushed and torn down.
    pub(crate) fn dereference(self: &Arc<Self>, map: &Arc<CacheMap>) {
        let lists = self.lists.lock();
        let open = map.open_count.load(Ordering::Acquire);
        if open == 0 {
            return;
        }
        map.open_count.store(open - 1, Ordering::Release);
        if open == 1 {
            self.delete_map(map, lists);
        }
    }

    /// Tears a map down: flush everything, drain the view index, unlink
    /// from the registry. Entered with the list lock held and the map's
    /// open count at zero.
    pub(crate) fn delete_map(self: &Arc<Self>, map: &Arc<CacheMap>, lists: MutexGuard<RootLists>) {
        // Hold the map open across the flush so concurrent releases
        // cannot re-enter teardown underneath us.
        map.open_count.store(1, Ordering::Release);
        drop(lists);

        // Teardown persists what it can; per-view write errors are
        // already accounted and a failed view simply dies dirty.
        let _ = flush::flush_range(map, 0, map.file_size());

        let mut lists = self.lists.lock();
        let open = map.open_count.fetch_sub(1, Ordering::AcqRel);
        if open != 1 {
            // Someone re-opened the file during the flush window.
            return;
        }

        let mut free_list: SmallVec<[ViewRef; 16]> = SmallVec::new();
        {
            let mut inner = map.inner.lock();
            while let Some((_, view)) = inner.views.pop_last() {
                lists.lru_remove(&view);
                if view.is_dirty() {
                    flush::unmark_dirty_locked(self, &mut lists, &mut inner, &view);
                }
                if view.clear_mapped() != 0 {
                    let refs = view.dec_ref();
                    debug_assert!(refs > 0, "mapped view held only the mapping reference");
                }
                free_list.push(view);
            }
            inner.private_maps.clear();
        }
        lists.maps.remove(&map.file_id());
        drop(lists);

        // The index references come off outside the locks. Anything that
        // does not reach zero is a caller still holding a guard; count it
        // and move on, the structure stays alive through its Arc.
        for view in free_list.drain(..) {
            let refs = view.dec_ref();
            if refs != 0 {
                self.leaked_views.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Aggregate usage of one per-file map.
#[derive(Debug, Clone)]
pub struct MapStats {
    pub file_id: FileId,
    pub open_count: u32,
    pub views: usize,
    pub valid_bytes: usize,
    pub dirty_pages: usize,
}

/// Usage summary of the whole cache.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_dirty_pages: usize,
    pub dirty_page_threshold: usize,
    pub leaked_views: usize,
    pub maps: Vec<MapStats>,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "dirty: {} pages ({} kb), threshold: {} pages, leaked views: {}",
            self.total_dirty_pages,
            (self.total_dirty_pages * PAGE_SIZE) / 1024,
            self.dirty_page_threshold,
            self.leaked_views
        )?;
        writeln!(f, "file\topen\tviews\tvalid kb\tdirty kb")?;
        for map in &self.maps {
            writeln!(
                f,
                "{}\t{}\t{}\t{}\t{}",
                map.file_id.0,
                map.open_count,
                map.views,
                map.valid_bytes / 1024,
                (map.dirty_pages * PAGE_SIZE) / 1024
            )?;
        }
        Ok(())
    }
}

/// The view cache subsystem.
pub struct CacheRoot {
    pub(crate) shared: Arc<RootShared>,
}

impl CacheRoot {
    /// Builds the subsystem over the given memory manager.
    pub fn new(mm: Arc<dyn MemoryManager>) -> Self {
        Self {
            shared: Arc::new(RootShared {
                lists: Mutex::new(RootLists {
                    seq: 0,
                    lru: std::collections::BTreeMap::new(),
                    dirty: std::collections::BTreeMap::new(),
                    maps: HashMap::new(),
                }),
                total_dirty_pages: AtomicUsize::new(0),
                dirty_page_threshold: AtomicUsize::new(0),
                leaked_views: AtomicUsize::new(0),
                mm,
                lazy_pending: Mutex::new(false),
                lazy_cv: Condvar::new(),
                lazy_scan_active: AtomicBool::new(false),
            }),
        }
    }

    /// Convenience constructor over [`HeapMemory`] with a page budget.
    pub fn with_heap_memory(max_pages: usize) -> Self {
        Self::new(Arc::new(HeapMemory::new(max_pages)))
    }

    /// Starts caching `file_id` for one opener. Re-initializing an already
    /// cached file attaches to the existing map; each successful call
    /// takes one open count, returned by releasing the handle.
    pub fn init_file_cache(
        &self,
        file_id: FileId,
        sizes: FileSizes,
        options: CacheOptions,
        backend: Arc<dyn CacheBackend>,
    ) -> Result<CacheHandle> {
        ensure!(
            sizes.file_size >= 0 && sizes.section_size >= sizes.file_size,
            CacheError::InvalidParameter("file sizes are inconsistent")
        );

        let mut lists = self.shared.lists.lock();
        let map = match lists.maps.get(&file_id) {
            Some(map) => map.clone(),
            None => {
                let map = CacheMap::new(
                    file_id,
                    sizes,
                    options,
                    backend,
                    Arc::downgrade(&self.shared),
                );
                lists.maps.insert(file_id, map.clone());
                map
            }
        };

        let private = Arc::new(PrivateCacheMap::new());
        map.attach_private(private.clone());
        let open = map.open_count.load(Ordering::Acquire);
        map.open_count.store(open + 1, Ordering::Release);
        drop(lists);

        Ok(CacheHandle::new(map, private))
    }

    /// The map currently caching `file_id`, if any.
    pub fn map(&self, file_id: FileId) -> Option<Arc<CacheMap>> {
        self.shared.lists.lock().maps.get(&file_id).cloned()
    }

    /// Takes one additional open count on an already cached file.
    pub fn reference_map(&self, file_id: FileId) {
        let lists = self.shared.lists.lock();
        let map = lists
            .maps
            .get(&file_id)
            .expect("referencing a file with no cache map");
        let open = map.open_count.load(Ordering::Acquire);
        assert!(open != 0, "referencing a cache map that is already closed");
        map.open_count.store(open + 1, Ordering::Release);
    }

    /// Drops one open count; the last one triggers teardown.
    pub fn dereference_map(&self, file_id: FileId) {
        let map = self
            .map(file_id)
            .expect("dereferencing a file with no cache map");
        self.shared.dereference(&map);
    }

    /// Tears down the file's map if nothing holds it open. Races with
    /// concurrent opens resolve under the registry lock.
    pub fn remove_if_closed(&self, file_id: FileId) {
        let lists = self.shared.lists.lock();
        let Some(map) = lists.maps.get(&file_id).cloned() else {
            return;
        };
        if map.open_count.load(Ordering::Acquire) == 0 {
            self.shared.delete_map(&map, lists);
        }
    }

    /// Synchronously writes back the dirty views of `file_id` in `range`
    /// (the whole file when `None`). The first write error is returned;
    /// later buckets are still attempted.
    pub fn flush_cache(&self, file_id: FileId, range: Option<(i64, i64)>) -> Result<()> {
        let Some(map) = self.map(file_id) else {
            bail!(CacheError::InvalidParameter("no cache map for file"));
        };
        let (offset, length) = range.unwrap_or((0, map.file_size()));
        flush::flush_range(&map, offset, length)
    }

    /// Writes back dirty views from the front of the dirty list until
    /// `target_pages` pages are covered or the list is exhausted. Returns
    /// the pages written. See the flush engine for the skip rules.
    pub fn flush_dirty(&self, target_pages: usize, wait: bool, from_lazy: bool) -> usize {
        flush::flush_dirty(&self.shared, target_pages, wait, from_lazy)
    }

    /// Reclaims cache memory, aiming for `target_pages` pages. Clean
    /// mapped views are paged out in place; unreferenced views are freed
    /// outright. Returns the pages accounted as freed.
    pub fn trim(&self, target_pages: usize, priority: u32) -> usize {
        trim::trim_cache(&self.shared, target_pages, priority)
    }

    /// Advisory count of dirty pages across all maps.
    pub fn total_dirty_pages(&self) -> usize {
        self.shared.total_dirty_pages.load(Ordering::Acquire)
    }

    /// Dirty-page ceiling exposed to writers for admission control. The
    /// cache itself never throttles; producers read this and the dirty
    /// count and pace themselves.
    pub fn dirty_page_threshold(&self) -> usize {
        self.shared.dirty_page_threshold.load(Ordering::Acquire)
    }

    pub fn set_dirty_page_threshold(&self, pages: usize) {
        self.shared
            .dirty_page_threshold
            .store(pages, Ordering::Release);
    }

    /// Number of views that still had references at map teardown. A
    /// non-zero value means some holder never released; the structures
    /// stay alive but their file is gone.
    pub fn leaked_views(&self) -> usize {
        self.shared.leaked_views.load(Ordering::Acquire)
    }

    /// Blocks the calling lazy writer until a scan is requested. The
    /// caller then owns the scan and finishes it with
    /// [`CacheRoot::lazy_scan_done`].
    pub fn wait_lazy_scan(&self) {
        let shared = &self.shared;
        let mut pending = shared.lazy_pending.lock();
        while !*pending {
            shared.lazy_cv.wait(&mut pending);
        }
        *pending = false;
        shared.lazy_scan_active.store(true, Ordering::Release);
    }

    /// [`CacheRoot::wait_lazy_scan`] with a timeout; `false` means the
    /// timeout passed with no scan requested.
    pub fn wait_lazy_scan_for(&self, timeout: Duration) -> bool {
        let shared = &self.shared;
        let mut pending = shared.lazy_pending.lock();
        if !*pending {
            let _ = shared.lazy_cv.wait_for(&mut pending, timeout);
        }
        if !*pending {
            return false;
        }
        *pending = false;
        shared.lazy_scan_active.store(true, Ordering::Release);
        true
    }

    pub fn lazy_scan_done(&self) {
        self.shared.lazy_scan_active.store(false, Ordering::Release);
    }

    /// Usage summary across all maps.
    pub fn stats(&self) -> CacheStats {
        let lists = self.shared.lists.lock();
        let mut maps: Vec<MapStats> = lists
            .maps
            .values()
            .map(|map| {
                let inner = map.inner.lock();
                let valid_bytes = inner
                    .views
                    .values()
                    .filter(|v| v.is_valid())
                    .count()
                    * VIEW_GRANULARITY;
                MapStats {
                    file_id: map.file_id(),
                    open_count: map.open_count(),
                    views: inner.views.len(),
                    valid_bytes,
                    dirty_pages: inner.dirty_pages,
                }
            })
            .collect();
        maps.sort_by_key(|m| m.file_id);

        CacheStats {
            total_dirty_pages: self.shared.total_dirty_pages.load(Ordering::Acquire),
            dirty_page_threshold: self.shared.dirty_page_threshold.load(Ordering::Acquire),
            leaked_views: self.shared.leaked_views.load(Ordering::Acquire),
            maps,
        }
    }
}

const _: () = {
    // The trim accounting assumes whole views; keep the derived constant
    // in scope so a config change that breaks it fails loudly here.
    assert!(PAGES_PER_VIEW * PAGE_SIZE == VIEW_GRANULARITY);
};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::testing::{dirty_view, open_file, test_root, MemBackend};
    use super::*;
    use crate::config::VIEW_GRANULARITY;

    const G: i64 = VIEW_GRANULARITY as i64;

    #[test]
    fn reinitializing_attaches_to_the_existing_map() {
        let root = test_root();
        let (first, backend) = open_file(&root, 1, 4);

        let second = root
            .init_file_cache(
                FileId(1),
                FileSizes {
                    file_size: 4 * G,
                    section_size: 4 * G,
                },
                CacheOptions::default(),
                backend.clone(),
            )
            .unwrap();

        assert!(Arc::ptr_eq(first.map(), second.map()));
        assert_eq!(first.map().open_count(), 2);

        second.release();
        assert_eq!(first.map().open_count(), 1);
        assert!(root.map(FileId(1)).is_some());
    }

    #[test]
    fn inconsistent_sizes_are_refused() {
        let root = test_root();
        let backend = MemBackend::new(0);
        let err = root
            .init_file_cache(
                FileId(1),
                FileSizes {
                    file_size: 2 * G,
                    section_size: G,
                },
                CacheOptions::default(),
                backend,
            )
            .unwrap_err();
        assert!(err.downcast_ref::<CacheError>().is_some());
    }

    #[test]
    fn last_release_tears_the_map_down_and_flushes() {
        let root = test_root();
        let (handle, backend) = open_file(&root, 1, 4);
        let map = handle.map().clone();

        for i in 0..3 {
            dirty_view(&map, i * G, 0x20 + i as u8);
        }

        handle.release();

        assert!(root.map(FileId(1)).is_none());
        assert_eq!(backend.write_count(), 3);
        assert_eq!(root.total_dirty_pages(), 0);
        assert_eq!(root.leaked_views(), 0);

        let contents = backend.contents();
        for i in 0..3 {
            assert_eq!(contents[i * VIEW_GRANULARITY], 0x20 + i as u8);
        }
    }

    #[test]
    fn reference_keeps_a_map_alive_across_a_release() {
        let root = test_root();
        let (handle, _backend) = open_file(&root, 1, 2);

        root.reference_map(FileId(1));
        handle.release();

        assert!(root.map(FileId(1)).is_some());
        root.dereference_map(FileId(1));
        assert!(root.map(FileId(1)).is_none());
    }

    #[test]
    fn remove_if_closed_ignores_open_maps() {
        let root = test_root();
        let (handle, _backend) = open_file(&root, 1, 2);

        root.remove_if_closed(FileId(1));
        assert!(root.map(FileId(1)).is_some());
        drop(handle);
        root.remove_if_closed(FileId(1));
        assert!(root.map(FileId(1)).is_none());
    }

    #[test]
    fn dirty_threshold_is_runtime_mutable() {
        let root = test_root();
        assert_eq!(root.dirty_page_threshold(), 0);
        root.set_dirty_page_threshold(1024);
        assert_eq!(root.dirty_page_threshold(), 1024);
    }

    #[test]
    fn marking_dirty_wakes_the_lazy_writer() {
        let root = test_root();
        let (handle, _backend) = open_file(&root, 1, 2);

        assert!(!root.wait_lazy_scan_for(Duration::from_millis(1)));

        dirty_view(handle.map(), 0, 0x01);

        assert!(root.wait_lazy_scan_for(Duration::from_millis(100)));
        root.flush_dirty(usize::MAX, true, true);
        root.lazy_scan_done();
    }

    #[test]
    fn stats_summarize_per_map_usage() {
        let root = test_root();
        let (handle, _backend) = open_file(&root, 7, 4);
        let map = handle.map().clone();

        dirty_view(&map, 0, 0x01);
        map.get_view(G).unwrap().release(true, false);

        let stats = root.stats();
        assert_eq!(stats.total_dirty_pages, PAGES_PER_VIEW);
        assert_eq!(stats.maps.len(), 1);
        assert_eq!(stats.maps[0].file_id, FileId(7));
        assert_eq!(stats.maps[0].views, 2);
        assert_eq!(stats.maps[0].valid_bytes, 2 * VIEW_GRANULARITY);
        assert_eq!(stats.maps[0].dirty_pages, PAGES_PER_VIEW);

        let rendered = stats.to_string();
        assert!(rendered.contains("dirty:"));
        assert!(rendered.contains('7'));
    }
}
