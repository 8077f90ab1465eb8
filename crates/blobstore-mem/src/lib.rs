#![deny(unsafe_code)]
//! blobstore-mem: in-process blob backends and their lifecycle plumbing.
//!
//! Heap, chunked and native backends implement
//! `blobstore_core::BlobContainer` directly. Native memory is the one
//! resource here that outlives ordinary drops; it is released through the
//! [`Reclaimer`] registry, and live instances are counted by the
//! [`UsageMonitor`]. Raw allocation is confined to [`alloc`] and the counting
//! test allocator in [`tracking`].

#[allow(unsafe_code)]
pub mod alloc;
pub mod chunked;
pub mod heap;
pub mod legacy;
pub mod monitor;
pub mod native;
pub mod reclaim;
#[allow(unsafe_code)]
pub mod tracking;

pub use blobstore_core::{Error, Result};
pub use alloc::{NativeAllocator, NativeRegion, SystemAllocator};
pub use chunked::{ChunkedBuffer, DEFAULT_CHUNK_SIZE};
pub use heap::HeapBuffer;
pub use legacy::{LegacyAdapter, LegacyContainer};
pub use monitor::{KindUsage, LiveStats, UsageMonitor, UsageSummary};
pub use native::{NativeBuffer, NativeSlot};
pub use reclaim::{Reclaim, ReaperHandle, ReclaimHandle, Reclaimer};
pub use tracking::{AllocStats, CountingAllocator, PeakTracker};
