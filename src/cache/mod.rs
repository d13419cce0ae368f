//! # View Cache
//!
//! The cache proper: per-file maps of granularity-sized views, the
//! reference state machine that governs every view's lifetime, and the
//! global dirty/reuse lists behind writeback and reclaim.
//!
//! ## Control Flow
//!
//! A filesystem initializes a map per file, then per I/O resolves a view,
//! copies bytes through it, and releases it with updated validity and
//! dirtiness. Dirty views accumulate on a global FIFO until the lazy
//! writer, an explicit flush, or teardown writes them back. The memory
//! manager calls trim under pressure, which pages out or frees the
//! coldest clean views.
//!
//! ```text
//! CacheRoot ──registry──▶ CacheMap (per file) ──index──▶ View
//!     │                        │                          ▲
//!     ├── reuse list (LRU) ────┼──────────────────────────┤
//!     ├── dirty FIFO ──────────┼──────────────────────────┤
//!     └── trim / flush_dirty   └── get / release / unmap ─┘
//! ```
//!
//! ## Module Organization
//!
//! - `backend`: the filesystem callback seam and the file-backed default
//! - `view`: the view structure, reference machine, and caller guard
//! - `map`: per-file index, handles, private read-ahead blocks
//! - `root`: registry, global lists, stats, lazy-writer wakeup
//! - `flush`: dirty tracking and the bulk writeback protocol
//! - `trim`: two-phase reclaim

mod backend;
mod flush;
mod map;
mod root;
mod trim;
mod view;

pub use backend::{CacheBackend, FileBackend};
pub use map::{
    CacheHandle, CacheMap, CacheOptions, FileId, FileSizes, PrivateCacheMap, ViewTrace,
};
pub use root::{CacheRoot, CacheStats, MapStats};
pub use view::ViewGuard;

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures: an in-memory backend with failure injection and
    //! shorthand for building roots, files, and dirty views.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::backend::CacheBackend;
    use super::map::{CacheHandle, CacheMap, CacheOptions, FileId, FileSizes};
    use super::root::CacheRoot;
    use crate::config::{PAGES_PER_VIEW, VIEW_GRANULARITY};
    use crate::error::WriteError;

    pub(crate) enum FailMode {
        EndOfFile,
        WriteProtected,
        Io,
    }

    pub(crate) struct MemBackend {
        data: Mutex<Vec<u8>>,
        busy: AtomicBool,
        fail_mode: Mutex<Option<FailMode>>,
        writes: AtomicUsize,
    }

    impl MemBackend {
        pub(crate) fn new(len: usize) -> Arc<Self> {
            Arc::new(Self {
                data: Mutex::new(vec![0; len]),
                busy: AtomicBool::new(false),
                fail_mode: Mutex::new(None),
                writes: AtomicUsize::new(0),
            })
        }

        pub(crate) fn contents(&self) -> Vec<u8> {
            self.data.lock().clone()
        }

        /// When busy, non-waiting lazy acquires refuse.
        pub(crate) fn set_busy(&self, busy: bool) {
            self.busy.store(busy, Ordering::Release);
        }

        pub(crate) fn fail_with(&self, mode: Option<FailMode>) {
            *self.fail_mode.lock() = mode;
        }

        pub(crate) fn write_count(&self) -> usize {
            self.writes.load(Ordering::Acquire)
        }
    }

    impl CacheBackend for MemBackend {
        fn acquire_for_lazy_write(&self, wait: bool) -> bool {
            wait || !self.busy.load(Ordering::Acquire)
        }

        fn release_from_lazy_write(&self) {}

        fn write_back(&self, offset: i64, data: &[u8]) -> Result<(), WriteError> {
            match *self.fail_mode.lock() {
                Some(FailMode::EndOfFile) => return Err(WriteError::EndOfFile),
                Some(FailMode::WriteProtected) => return Err(WriteError::WriteProtected),
                Some(FailMode::Io) => {
                    return Err(WriteError::Io(std::io::Error::other("injected failure")))
                }
                None => {}
            }

            let mut file = self.data.lock();
            let offset = offset as usize;
            if file.len() < offset + data.len() {
                file.resize(offset + data.len(), 0);
            }
            file[offset..offset + data.len()].copy_from_slice(data);
            self.writes.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    pub(crate) fn test_root() -> CacheRoot {
        CacheRoot::with_heap_memory(64 * PAGES_PER_VIEW)
    }

    pub(crate) fn open_file(
        root: &CacheRoot,
        id: u64,
        views: i64,
    ) -> (CacheHandle, Arc<MemBackend>) {
        open_with_options(root, id, views, CacheOptions::default())
    }

    pub(crate) fn open_temporary(
        root: &CacheRoot,
        id: u64,
        views: i64,
    ) -> (CacheHandle, Arc<MemBackend>) {
        open_with_options(
            root,
            id,
            views,
            CacheOptions {
                temporary: true,
                ..CacheOptions::default()
            },
        )
    }

    fn open_with_options(
        root: &CacheRoot,
        id: u64,
        views: i64,
        options: CacheOptions,
    ) -> (CacheHandle, Arc<MemBackend>) {
        let len = views * VIEW_GRANULARITY as i64;
        let backend = MemBackend::new(len as usize);
        let handle = root
            .init_file_cache(
                FileId(id),
                FileSizes {
                    file_size: len,
                    section_size: len,
                },
                options,
                backend.clone(),
            )
            .unwrap();
        (handle, backend)
    }

    /// Fills the view at `offset` with `fill` and releases it dirty.
    pub(crate) fn dirty_view(map: &Arc<CacheMap>, offset: i64, fill: u8) {
        let mut guard = map.get_view(offset).unwrap();
        guard.data_mut().fill(fill);
        guard.release(true, true);
    }
}
