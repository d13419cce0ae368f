//! # Dirty Tracking and Writeback
//!
//! Dirtying a view links it onto the global dirty FIFO and takes one
//! reference; writeback reverses both. The bulk path walks the FIFO from
//! the head and restarts from the head after every callout, because the
//! list may have changed while the locks were down. Per candidate it
//! skips, rather than blocks on, anything it should not touch: temporary
//! files during lazy scans, files whose lazy-write lock would block, and
//! views with an active user.
//!
//! A writeback that fails with end-of-file or a write-protected medium
//! still counts toward the flush target. Retrying those can never succeed,
//! and not counting them would turn every bulk flush into a full-list
//! rescan of the same doomed views.
//!
//! Progress is structural: a successful write shrinks the dirty list
//! before the walk restarts, and every failure advances the walk past the
//! candidate, so each call visits a failing view at most once.

use std::ops::Bound;
use std::sync::Arc;

use eyre::{eyre, Result};

use super::map::{release_view, CacheMap, MapInner};
use super::root::{RootLists, RootShared};
use super::view::ViewRef;
use crate::config::{view_round_down, PAGES_PER_VIEW, VIEW_GRANULARITY};
use crate::error::{CacheError, WriteError};

/// Reference count of a flush candidate nobody else is using: the map
/// index, the dirty list, and the flush hold itself.
const FLUSH_IDLE_REFS: u32 = 3;

/// Puts `view` on the dirty list unless a racing release already did.
/// The dirty check and the list insertion happen under the same locks, so
/// the list sees each view at most once however many holders dirtied it.
pub(crate) fn mark_dirty_view(shared: &Arc<RootShared>, map: &Arc<CacheMap>, view: &ViewRef) {
    {
        let mut lists = shared.lists.lock();
        let mut inner = map.inner.lock();

        if view.is_dirty() {
            return;
        }

        lists.dirty_push_tail(view);
        shared
            .total_dirty_pages
            .fetch_add(PAGES_PER_VIEW, std::sync::atomic::Ordering::AcqRel);
        inner.dirty_pages += PAGES_PER_VIEW;
        view.inc_ref();

        // Fresh dirt is the strongest recency signal there is.
        lists.lru_move_tail(view);

        view.set_dirty(true);
    }

    shared.schedule_lazy_scan();
}

/// Takes `view` off the dirty list, dropping the list's reference.
pub(crate) fn unmark_dirty_view(shared: &Arc<RootShared>, map: &Arc<CacheMap>, view: &ViewRef) {
    let mut lists = shared.lists.lock();
    let mut inner = map.inner.lock();
    unmark_dirty_locked(shared, &mut lists, &mut inner, view);
}

pub(crate) fn unmark_dirty_locked(
    shared: &Arc<RootShared>,
    lists: &mut RootLists,
    inner: &mut MapInner,
    view: &ViewRef,
) {
    assert!(view.is_dirty(), "unmarking a clean view");

    view.set_dirty(false);
    lists.dirty_remove(view);
    shared
        .total_dirty_pages
        .fetch_sub(PAGES_PER_VIEW, std::sync::atomic::Ordering::AcqRel);
    inner.dirty_pages -= PAGES_PER_VIEW;
    view.dec_ref();
}

/// Writes one view back through the filesystem. On success the view comes
/// off the dirty list; on failure it stays dirty and the error is the
/// caller's to account. No cache locks may be held on entry.
pub(crate) fn flush_one(
    shared: &Arc<RootShared>,
    map: &Arc<CacheMap>,
    view: &ViewRef,
) -> Result<(), WriteError> {
    // SAFETY: the caller holds a reference on the view, which keeps the
    // mapping alive for the duration of the write.
    let data = unsafe { view.slice() };
    map.backend().write_back(view.file_offset(), data)?;
    unmark_dirty_view(shared, map, view);
    Ok(())
}

/// Walks the dirty list from the head writing views back until
/// `target_pages` pages are covered or the list is exhausted. Returns the
/// pages written (counting terminal failures, see the module docs).
pub(crate) fn flush_dirty(
    shared: &Arc<RootShared>,
    target_pages: usize,
    wait: bool,
    from_lazy: bool,
) -> usize {
    let mut written = 0usize;
    let mut target = target_pages;
    let mut cursor = 0u64;

    let mut lists = shared.lists.lock();
    while target > 0 {
        let next = lists
            .dirty
            .range((Bound::Excluded(cursor), Bound::Unbounded))
            .next()
            .map(|(key, view)| (*key, view.clone()));
        let Some((key, view)) = next else { break };
        cursor = key;

        view.inc_ref();
        let map = view.owner();

        // Temporary files live and die without ever hitting storage
        // unless someone flushes them explicitly.
        if from_lazy && map.is_temporary() {
            view.dec_ref();
            continue;
        }

        if !map.backend().acquire_for_lazy_write(wait) {
            view.dec_ref();
            continue;
        }

        assert!(view.is_dirty(), "clean view on the dirty list");

        if view.ref_count() > FLUSH_IDLE_REFS {
            map.backend().release_from_lazy_write();
            view.dec_ref();
            continue;
        }

        drop(lists);
        let status = flush_one(shared, &map, &view);
        // The lazy lock goes back before the list lock is retaken;
        // another flusher may be waiting for it while holding the list
        // lock, and this ordering is what keeps that from wedging.
        map.backend().release_from_lazy_write();
        lists = shared.lists.lock();
        view.dec_ref();

        match status {
            Ok(()) => {
                written += PAGES_PER_VIEW;
                target = target.saturating_sub(PAGES_PER_VIEW);
                // The list may have mutated while the locks were down,
                // and the written view is off it now, so restarting from
                // the head cannot revisit anything.
                cursor = 0;
            }
            Err(WriteError::EndOfFile) | Err(WriteError::WriteProtected) => {
                written += PAGES_PER_VIEW;
                target = target.saturating_sub(PAGES_PER_VIEW);
                // Still dirty and still listed; move past it or the scan
                // would pick it again forever.
            }
            Err(_) => {
                // Same: stays dirty, counts for nothing, scan moves on.
            }
        }
    }
    drop(lists);

    written
}

/// Flushes every dirty view intersecting `[offset, offset + length)`.
/// The first write error is reported; later buckets are still attempted.
pub(crate) fn flush_range(map: &Arc<CacheMap>, offset: i64, length: i64) -> Result<()> {
    let shared = map.root();
    let mut first_err: Option<WriteError> = None;

    let mut bucket = view_round_down(offset.max(0));
    let end = offset.saturating_add(length);
    while bucket < end {
        if let Some(view) = map.lookup(bucket) {
            if view.is_dirty() {
                if let Err(err) = flush_one(&shared, map, &view) {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
            let valid = view.is_valid();
            let dirty = view.is_dirty();
            release_view(map, &view, valid, dirty, false);
        }
        bucket += VIEW_GRANULARITY as i64;
    }

    match first_err {
        Some(err) => Err(eyre!(CacheError::Io(err))),
        None => Ok(()),
    }
}
