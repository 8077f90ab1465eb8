//! Allocation accounting for native memory.
//!
//! [`CountingAllocator`] wraps the system allocator and records every
//! allocate/free, the live byte total and its peak. Frees of addresses it does
//! not consider live are counted instead of forwarded, which turns a double
//! free into an assertion rather than heap corruption.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use blobstore_core::Result;

use crate::alloc::{NativeAllocator, SystemAllocator};

#[derive(Debug, Default)]
pub struct PeakTracker {
    peak_bytes: AtomicUsize,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self {
            peak_bytes: AtomicUsize::new(0),
        }
    }

    /// Record a new "live bytes" value; updates peak if higher.
    pub fn record_used(&self, used_bytes: usize) {
        let mut cur = self.peak_bytes.load(Ordering::Relaxed);
        while used_bytes > cur {
            match self.peak_bytes.compare_exchange(
                cur,
                used_bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        tracing::trace!(
            used_bytes,
            peak = self.peak_bytes.load(Ordering::Relaxed),
            "native usage"
        );
    }

    pub fn peak(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }
}

/// Snapshot of a [`CountingAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    pub allocations: u64,
    pub frees: u64,
    pub invalid_frees: u64,
    pub live_bytes: usize,
    pub peak_bytes: usize,
}

#[derive(Debug, Default)]
pub struct CountingAllocator {
    live: Mutex<HashMap<usize, usize>>,
    live_bytes: AtomicUsize,
    allocations: AtomicU64,
    frees: AtomicU64,
    invalid_frees: AtomicU64,
    peak: PeakTracker,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> AllocStats {
        AllocStats {
            allocations: self.allocations.load(Ordering::Acquire),
            frees: self.frees.load(Ordering::Acquire),
            invalid_frees: self.invalid_frees.load(Ordering::Acquire),
            live_bytes: self.live_bytes.load(Ordering::Acquire),
            peak_bytes: self.peak.peak(),
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.live.lock().len()
    }
}

impl NativeAllocator for CountingAllocator {
    fn allocate(&self, bytes: usize) -> Result<NonNull<u8>> {
        let ptr = SystemAllocator.allocate(bytes)?;
        self.live.lock().insert(ptr.as_ptr() as usize, bytes);
        self.allocations.fetch_add(1, Ordering::AcqRel);
        let live = self.live_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak.record_used(live);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize) {
        let known = self.live.lock().remove(&(ptr.as_ptr() as usize));
        match known {
            Some(size) if size == bytes => {
                self.frees.fetch_add(1, Ordering::AcqRel);
                self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
                // SAFETY: the address was live and allocated with this size.
                unsafe { SystemAllocator.deallocate(ptr, bytes) };
            }
            _ => {
                self.invalid_frees.fetch_add(1, Ordering::AcqRel);
                tracing::warn!(bytes, "free of an address that is not live");
            }
        }
    }
}
