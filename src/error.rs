//! # Cache Error Values
//!
//! Typed error values raised through `eyre`. Callers that need to react to
//! a specific kind (a missed lookup, a writeback that hit end-of-file)
//! downcast the report; everything else treats errors uniformly.
//!
//! Invariant violations are not represented here. Corrupted state such as
//! marking an already-dirty view dirty, a refcount underflow, or a failed
//! free precondition panics at the detection site.

use std::fmt;

use crate::FileId;

/// Failure reported by a backend `write_back` call.
///
/// `EndOfFile` and `WriteProtected` are terminal for the view (retrying
/// cannot succeed) but harmless for the cache, so bulk flushing counts
/// them as written instead of keeping the view on the dirty list forever.
#[derive(Debug)]
pub enum WriteError {
    /// The view lies beyond the current end of the backing file.
    EndOfFile,
    /// The backing medium refuses writes.
    WriteProtected,
    /// Any other I/O failure. The view stays dirty and will be retried.
    Io(std::io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::EndOfFile => write!(f, "write beyond end of file"),
            WriteError::WriteProtected => write!(f, "backing medium is write protected"),
            WriteError::Io(err) => write!(f, "writeback failed: {}", err),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriteError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WriteError {
    fn from(err: std::io::Error) -> Self {
        WriteError::Io(err)
    }
}

#[derive(Debug)]
pub enum CacheError {
    /// An offset beyond the section, a negative offset, or an argument
    /// that violates a documented precondition.
    InvalidParameter(&'static str),
    /// A view mapping or page allocation could not be satisfied.
    OutOfResources {
        requested_pages: usize,
        available_pages: usize,
    },
    /// The operation requires a view at the given offset and none exists.
    ViewNotFound { file_id: FileId, file_offset: i64 },
    /// A writeback failure surfaced through a synchronous flush.
    Io(WriteError),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::InvalidParameter(what) => write!(f, "invalid parameter: {}", what),
            CacheError::OutOfResources {
                requested_pages,
                available_pages,
            } => write!(
                f,
                "out of cache pages: requested {} but only {} available",
                requested_pages, available_pages
            ),
            CacheError::ViewNotFound {
                file_id,
                file_offset,
            } => write!(
                f,
                "no view for file {} at offset {:#x}",
                file_id.0, file_offset
            ),
            CacheError::Io(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<WriteError> for CacheError {
    fn from(err: WriteError) -> Self {
        CacheError::Io(err)
    }
}
