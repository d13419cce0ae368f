//! # Cache Configuration Constants
//!
//! All sizing constants for the view cache live here. The fundamental unit
//! is the *view*: a `VIEW_GRANULARITY`-sized, page-aligned slice of a file
//! mapped at a stable address for its whole lifetime.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       └─> VIEW_GRANULARITY (256 KiB)
//!             Must be a non-zero multiple of PAGE_SIZE; every view
//!             boundary in a file is a multiple of it.
//!             │
//!             └─> PAGES_PER_VIEW (derived: VIEW_GRANULARITY / PAGE_SIZE)
//!                   The unit of dirty-page and trim accounting. Flush
//!                   and trim targets are expressed in pages, and one
//!                   view always accounts for exactly this many.
//! ```
//!
//! ## Modifying Constants
//!
//! `VIEW_GRANULARITY` trades address-space consumption against mapping
//! overhead per cached byte. It can be changed freely as long as the
//! compile-time assertions below still hold; all accounting is derived.

/// Size of one physical page. Mapping, page-out and dirty accounting all
/// work in units of this.
pub const PAGE_SIZE: usize = 4096;

/// Size of one view. Every cached file range is carved into buckets of
/// this size, aligned to it.
pub const VIEW_GRANULARITY: usize = 256 * 1024;

/// Number of physical pages backing one view.
pub const PAGES_PER_VIEW: usize = VIEW_GRANULARITY / PAGE_SIZE;

/// Byte pattern written over a view's mapping just before it is freed,
/// so stale pointers into a dead view read as garbage instead of data.
pub const VIEW_POISON: u8 = 0xfd;

const _: () = assert!(
    VIEW_GRANULARITY % PAGE_SIZE == 0,
    "VIEW_GRANULARITY must be a multiple of PAGE_SIZE"
);

const _: () = assert!(PAGES_PER_VIEW >= 1, "a view must span at least one page");

const _: () = assert!(
    VIEW_GRANULARITY <= i64::MAX as usize,
    "view offsets are signed 64-bit file offsets"
);

/// Rounds a file offset down to the containing view boundary.
#[inline]
pub const fn view_round_down(offset: i64) -> i64 {
    offset - offset % VIEW_GRANULARITY as i64
}

/// True when `offset` falls inside the view starting at `view_offset`.
#[inline]
pub const fn view_contains(view_offset: i64, offset: i64) -> bool {
    offset >= view_offset && offset < view_offset + VIEW_GRANULARITY as i64
}
