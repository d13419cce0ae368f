//! # Memory Reclaim
//!
//! Trim walks the reuse list oldest-first in two phases. Phase one frees
//! RAM without freeing structure: a clean view that still has external
//! mappings gets its pages released in place, keeping its address and
//! bookkeeping so the mappings stay coherent. A view nobody holds at all
//! is unlinked and queued for destruction. Phase two runs once per call:
//! if the target was not met, flush some dirty views and take a second
//! pass over whatever that made reclaimable, capped at the page count the
//! flush actually produced.
//!
//! Queued views die after the locks are released; their last reference is
//! the index membership the walk stripped, so the drop here is the one
//! that hits zero.

use std::ops::Bound;
use std::sync::Arc;

use smallvec::SmallVec;

use super::flush;
use super::root::RootShared;
use super::view::ViewRef;
use crate::config::PAGES_PER_VIEW;

pub(crate) fn trim_cache(shared: &Arc<RootShared>, target_pages: usize, _priority: u32) -> usize {
    let mut freed = 0usize;
    let mut target = target_pages;
    let mut flushed_once = false;
    let mut free_list: SmallVec<[ViewRef; 16]> = SmallVec::new();

    loop {
        let mut lists = shared.lists.lock();
        let mut cursor = 0u64;

        loop {
            let next = lists
                .lru
                .range((Bound::Excluded(cursor), Bound::Unbounded))
                .next()
                .map(|(key, view)| (*key, view.clone()));
            let Some((key, view)) = next else { break };
            cursor = key;

            let map = view.owner();
            let mut inner = map.inner.lock();
            view.inc_ref();

            if view.mapped_count() > 0 && !view.is_dirty() {
                // Dropping RAM blocks, so the locks go down around it.
                // The walk resumes from the cursor; the saved position is
                // a sequence key, which stays meaningful however much the
                // list changes meanwhile.
                drop(inner);
                drop(lists);

                view.page_out();

                lists = shared.lists.lock();
                inner = map.inner.lock();
            }

            let refs = view.dec_ref();
            if refs < 2 {
                // Only the index holds it; nobody can re-find it once we
                // unlink, so it is ours to destroy.
                assert!(!view.is_dirty(), "evicting a dirty view");
                assert_eq!(view.mapped_count(), 0, "evicting a mapped view");
                assert_eq!(refs, 1, "evicted view lost its index reference");

                inner.views.remove(&view.file_offset());
                lists.lru_remove(&view);
                free_list.push(view);

                let pages = PAGES_PER_VIEW.min(target);
                target -= pages;
                freed += pages;
            }
            drop(inner);
        }
        drop(lists);

        if target > 0 && !flushed_once {
            let written = flush::flush_dirty(shared, target, false, false);
            flushed_once = true;
            // Flushing is the only thing that can have made more views
            // reclaimable, so it bounds what a second pass can find.
            if written < target {
                target = written;
            }
            if written != 0 {
                continue;
            }
        }
        break;
    }

    for view in free_list.drain(..) {
        let refs = view.dec_ref();
        assert_eq!(refs, 0, "trimmed view still referenced");
    }

    freed
}

#[cfg(test)]
mod tests {
    use super::super::testing::{dirty_view, open_file, test_root};
    use crate::config::{PAGES_PER_VIEW, VIEW_GRANULARITY};

    const G: i64 = VIEW_GRANULARITY as i64;

    #[test]
    fn trim_frees_unreferenced_clean_views() {
        let root = test_root();
        let (handle, _backend) = open_file(&root, 1, 8);
        let map = handle.map().clone();

        for i in 0..4 {
            let guard = map.get_view(i * G).unwrap();
            guard.release(true, false);
        }

        let freed = root.trim(usize::MAX, 0);

        assert_eq!(freed, 4 * PAGES_PER_VIEW);
        assert!(map.lookup(0).is_none());
        assert!(map.trace_snapshot().is_empty());
    }

    #[test]
    fn trim_leaves_dirty_views_alone_without_flush_headroom() {
        let root = test_root();
        let (handle, backend) = open_file(&root, 1, 4);
        let map = handle.map().clone();

        dirty_view(&map, 0, 0x42);
        backend.set_busy(true);

        // Non-waiting flush cannot acquire the file, so nothing becomes
        // reclaimable.
        let freed = root.trim(usize::MAX, 0);
        assert_eq!(freed, 0);

        let view = map.lookup(0).unwrap();
        assert!(view.is_dirty());
        view.dec_ref();
        backend.set_busy(false);
    }

    #[test]
    fn trim_pages_out_mapped_views_but_keeps_them() {
        let root = test_root();
        let (handle, _backend) = open_file(&root, 1, 4);
        let map = handle.map().clone();

        let guard = map.get_view(0).unwrap();
        guard.release_mapped(true, false);

        let freed = root.trim(usize::MAX, 0);
        assert_eq!(freed, 0);

        let view = map.lookup(0).unwrap();
        assert!(view.is_paged_out());
        assert!(!view.is_valid());
        assert_eq!(view.mapped_count(), 1);
        // Index + mapping + this lookup.
        assert!(view.ref_count() >= 3);
        view.dec_ref();

        map.unmap_view(0, false).unwrap();
    }

    #[test]
    fn trim_flushes_once_then_reclaims_what_it_flushed() {
        let root = test_root();
        let (handle, backend) = open_file(&root, 1, 8);
        let map = handle.map().clone();

        for i in 0..3 {
            dirty_view(&map, i * G, 0x10 + i as u8);
        }

        let freed = root.trim(usize::MAX, 0);

        assert_eq!(freed, 3 * PAGES_PER_VIEW);
        assert_eq!(root.total_dirty_pages(), 0);
        assert_eq!(backend.write_count(), 3);
        assert!(map.trace_snapshot().is_empty());
    }
}
