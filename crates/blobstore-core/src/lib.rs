#![forbid(unsafe_code)]
//! blobstore-core: contracts shared by every blob backend.
//!
//! Callers only ever talk to [`BlobContainer`] and [`BlobChannel`]. Concrete
//! backends live in `blobstore-mem` (heap, chunked, native) and `blobstore-io`
//! (disk); the adaptive dispatcher in `blobstore-exec` picks between them using
//! the [`ThresholdTable`] built from [`PayloadConfig`].

pub mod channel;
pub mod config;
pub mod container;
pub mod error;
pub mod kind;
pub mod prelude;
pub mod scoped;
pub mod threshold;

pub use channel::{
    copy_channel, BlobChannel, ChannelHook, ChannelIo, ChannelWrapper, CloseHook, StoreChannel,
};
pub use config::{DiskConfig, PayloadConfig, ThresholdEntry};
pub use container::{
    checked_range, copy_content, to_index, BlobBytes, BlobContainer, BufferView, DataBuffer,
    FileProvider,
};
pub use error::{Error, Result};
pub use kind::BackendKind;
pub use scoped::{FileStamp, TempFileProvider};
pub use threshold::ThresholdTable;
