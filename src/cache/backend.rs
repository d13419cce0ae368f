//! # Filesystem Backend Interface
//!
//! The cache persists views through a callback table supplied at per-file
//! init time, never by touching storage itself. [`CacheBackend`] is the
//! second polymorphism seam of the crate (the first is
//! [`crate::mm::MemoryManager`]): a filesystem implements it once per file
//! and the flush engine calls out through it with no cache locks held
//! around `write_back`.
//!
//! ## Lazy-Write Locking
//!
//! `acquire_for_lazy_write` / `release_from_lazy_write` bracket every bulk
//! flush of a view so the filesystem can order cache writeback against its
//! own metadata updates. In non-waiting mode the acquire may refuse with
//! `false`; the flush engine then skips the candidate rather than blocking.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::WriteError;

pub trait CacheBackend: Send + Sync {
    /// Acquires the file for writeback. Returns `false` iff `wait` is
    /// `false` and the acquisition would block.
    fn acquire_for_lazy_write(&self, wait: bool) -> bool;

    /// Releases a previously acquired lazy-write lock.
    fn release_from_lazy_write(&self);

    /// Persists one view's bytes at `offset`. The buffer is always exactly
    /// one view granularity long.
    fn write_back(&self, offset: i64, data: &[u8]) -> Result<(), WriteError>;
}

/// Backend over a plain [`File`].
///
/// Suitable for hosts whose backing store is a regular file and whose
/// writeback ordering needs nothing beyond mutual exclusion. The
/// lazy-write lock is a simple flag: writers spin in waiting mode and
/// refuse in non-waiting mode.
pub struct FileBackend {
    file: Mutex<File>,
    lazy_lock: AtomicBool,
}

impl FileBackend {
    pub fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
            lazy_lock: AtomicBool::new(false),
        }
    }
}

impl CacheBackend for FileBackend {
    fn acquire_for_lazy_write(&self, wait: bool) -> bool {
        loop {
            if self
                .lazy_lock
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            if !wait {
                return false;
            }
            std::hint::spin_loop();
        }
    }

    fn release_from_lazy_write(&self) {
        let was_held = self.lazy_lock.swap(false, Ordering::AcqRel);
        debug_assert!(was_held, "lazy-write lock released twice");
    }

    fn write_back(&self, offset: i64, data: &[u8]) -> Result<(), WriteError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn file_backend_writes_at_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backing");
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let backend = FileBackend::new(file);

        backend.write_back(8192, &[0xabu8; 64]).unwrap();

        let mut contents = Vec::new();
        File::open(&path)
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents.len(), 8192 + 64);
        assert_eq!(&contents[8192..], &[0xabu8; 64]);
    }

    #[test]
    fn lazy_lock_refuses_without_wait() {
        let dir = tempdir().unwrap();
        let file = File::create(dir.path().join("backing")).unwrap();
        let backend = FileBackend::new(file);

        assert!(backend.acquire_for_lazy_write(false));
        assert!(!backend.acquire_for_lazy_write(false));
        backend.release_from_lazy_write();
        assert!(backend.acquire_for_lazy_write(false));
        backend.release_from_lazy_write();
    }
}
