//! Zero-filled backing store.
//!
//! One contiguous, page-aligned allocation that concurrent requests copy in
//! and out of without locking each other. Callers address disjoint byte
//! ranges; ordering of overlapping writes belongs to the host dispatcher.

use crate::error::{Error, Result};
use std::alloc::{self, Layout};
use std::ptr::NonNull;

const BUFFER_ALIGN: usize = 4096;

/// Owned, zero-initialized memory region.
pub struct BackingBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer owns its allocation; cross-thread access goes through
// `read_at`/`write_at`, whose callers address disjoint ranges.
unsafe impl Send for BackingBuffer {}
unsafe impl Sync for BackingBuffer {}

impl BackingBuffer {
    /// Allocate `len` zeroed bytes.
    ///
    /// Fails with `Error::Allocation` if `len` is zero, too large for a
    /// layout, or refused by the allocator. Never aborts the process.
    pub fn zeroed(len: u64) -> Result<Self> {
        let alloc_err = || Error::Allocation {
            what: "backing buffer",
            bytes: len,
        };
        let size = usize::try_from(len).map_err(|_| alloc_err())?;
        if size == 0 {
            return Err(alloc_err());
        }
        let layout = Layout::from_size_align(size, BUFFER_ALIGN).map_err(|_| alloc_err())?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(alloc_err)?;

        Ok(Self { ptr, layout })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Copy `dst.len()` bytes starting at `pos` into `dst`.
    ///
    /// Panics if the range is out of bounds; the servicer clamps first.
    pub fn read_at(&self, pos: usize, dst: &mut [u8]) {
        self.check_range(pos, dst.len());
        // SAFETY: range checked above; `dst` is a distinct caller buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(pos), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Copy `src` into the buffer starting at `pos`.
    ///
    /// Panics if the range is out of bounds; the servicer clamps first.
    pub fn write_at(&self, pos: usize, src: &[u8]) {
        self.check_range(pos, src.len());
        // SAFETY: range checked above; concurrent writers target disjoint
        // ranges per the dispatch contract.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(pos), src.len());
        }
    }

    /// Snapshot of the whole buffer, for inspection and tests.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        self.read_at(0, &mut out);
        out
    }

    #[inline]
    fn check_range(&self, pos: usize, len: usize) {
        let end = pos.saturating_add(len);
        assert!(
            end <= self.len(),
            "buffer range {}..{} out of bounds ({})",
            pos,
            end,
            self.len()
        );
    }
}

impl Drop for BackingBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for BackingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingBuffer").field("len", &self.len()).finish()
    }
}
