//! # viewcache - File-Data View Cache
//!
//! viewcache maps ranges of regular files into fixed-size *views*: 256 KiB,
//! page-aligned slices held at a stable address for their whole lifetime.
//! Filesystems and higher layers read and mutate views in place, the cache
//! tracks which ones are dirty, writes them back through a filesystem
//! callback, and evicts the coldest clean views under memory pressure.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use viewcache::{CacheOptions, CacheRoot, FileBackend, FileId, FileSizes};
//!
//! let root = CacheRoot::with_heap_memory(4096);
//! let handle = root.init_file_cache(
//!     FileId(1),
//!     FileSizes { file_size: len, section_size: len },
//!     CacheOptions::default(),
//!     Arc::new(FileBackend::new(file)),
//! )?;
//!
//! let mut guard = handle.map().get_view(offset)?;
//! if !guard.is_valid() {
//!     // read the range from the file into guard.data_mut()
//! }
//! guard.data_mut()[off_in_view..][..n].copy_from_slice(bytes);
//! guard.release(true, true); // valid, and now dirty
//!
//! root.flush_dirty(usize::MAX, true, false); // or let the lazy writer run
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │       CacheRoot (registry, dirty, LRU)       │
//! ├──────────────────────────────────────────────┤
//! │  CacheMap per file (ordered view index)      │
//! ├──────────────────────────────────────────────┤
//! │  View (refcounted, stable base, 256 KiB)     │
//! ├───────────────────────┬──────────────────────┤
//! │ MemoryManager (pages) │ CacheBackend (write) │
//! └───────────────────────┴──────────────────────┘
//! ```
//!
//! Two seams keep the cache portable: [`MemoryManager`] supplies regions
//! and pages (default: anonymous mappings), and [`CacheBackend`] persists
//! views (default: a plain file). Everything between them is pure
//! bookkeeping: a per-file ordered index guaranteeing at most one view per
//! aligned offset even under racing misses, a per-view reference machine
//! whose zero transition frees the mapping, and global dirty/reuse lists
//! driving writeback and reclaim.
//!
//! ## Module Overview
//!
//! - [`cache`]: maps, views, guards, flush and trim engines
//! - [`mm`]: the memory-manager seam and its heap-backed default
//! - [`config`]: granularity and page-size constants
//! - [`error`]: typed error values raised through `eyre`

pub mod cache;
pub mod config;
pub mod error;
pub mod mm;

pub use cache::{
    CacheBackend, CacheHandle, CacheMap, CacheOptions, CacheRoot, CacheStats, FileBackend, FileId,
    FileSizes, MapStats, PrivateCacheMap, ViewGuard, ViewTrace,
};
pub use config::{PAGES_PER_VIEW, PAGE_SIZE, VIEW_GRANULARITY};
pub use error::{CacheError, WriteError};
pub use mm::{HeapMemory, MemoryManager, PageFrame, VaRegion};
