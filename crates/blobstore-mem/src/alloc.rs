//! Native allocation seam for the off-heap backend.
//!
//! All raw-pointer handling in the crate lives here. [`NativeRegion`] owns one
//! zeroed allocation and returns it to its allocator on drop, so freeing a
//! region exactly once is a matter of dropping it exactly once.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use blobstore_core::{Error, Result};

const ALIGN: usize = 8;

/// Source of native memory. Implementations must hand out zeroed memory.
pub trait NativeAllocator: Send + Sync + fmt::Debug {
    fn allocate(&self, bytes: usize) -> Result<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate(bytes)` on this allocator and must not
    /// have been passed to `deallocate` before.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize);
}

pub(crate) fn layout_for(bytes: usize) -> Result<Layout> {
    if bytes == 0 {
        return Err(Error::Alloc { bytes: 0 });
    }
    Layout::from_size_align(bytes, ALIGN).map_err(|_| Error::Alloc {
        bytes: bytes as u64,
    })
}

/// The process allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl NativeAllocator for SystemAllocator {
    fn allocate(&self, bytes: usize) -> Result<NonNull<u8>> {
        let layout = layout_for(bytes)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(Error::Alloc {
            bytes: bytes as u64,
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize) {
        if let Ok(layout) = layout_for(bytes) {
            // SAFETY: caller guarantees ptr came from allocate(bytes).
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

/// One live native allocation.
pub struct NativeRegion {
    ptr: NonNull<u8>,
    capacity: usize,
    allocator: Arc<dyn NativeAllocator>,
}

// SAFETY: the region uniquely owns its allocation; access goes through
// &self / &mut self like any owned buffer.
unsafe impl Send for NativeRegion {}

impl NativeRegion {
    /// Allocate `capacity` zeroed bytes. `capacity` must be non-zero.
    pub fn allocate(allocator: Arc<dyn NativeAllocator>, capacity: usize) -> Result<Self> {
        let ptr = allocator.allocate(capacity)?;
        Ok(Self {
            ptr,
            capacity,
            allocator,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for `capacity` initialized (zeroed) bytes for
        // as long as self lives.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }
}

impl Drop for NativeRegion {
    fn drop(&mut self) {
        // SAFETY: ptr came from allocate(capacity) on this allocator and drop
        // runs once.
        unsafe { self.allocator.deallocate(self.ptr, self.capacity) };
    }
}

impl fmt::Debug for NativeRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRegion")
            .field("capacity", &self.capacity)
            .field("allocator", &self.allocator)
            .finish()
    }
}
