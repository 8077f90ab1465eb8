#![deny(unsafe_code)]
//! blobstore-io: the temp-file-backed blob backend.
//!
//! - `DiskBuffer`: one temp file per instance, reclaimed through the disk
//!   `Reclaimer` from `blobstore-mem`.
//! - `DiskCache`: shared, byte-bounded LRU of materialized content.
//! - `DiskFileProvider`: scoped access to the real backing file.

pub mod cache;
pub mod disk;
#[allow(unsafe_code)]
mod mapped;

pub use blobstore_core::{Error, Result};
pub use cache::{CacheStats, DiskCache};
pub use disk::{file_etag, DiskBuffer, DiskFile, DiskFileProvider, FileChannel};
