//! Glob import for backend implementations.

pub use crate::channel::{BlobChannel, ChannelIo, ChannelWrapper, StoreChannel};
pub use crate::container::{BlobBytes, BlobContainer, DataBuffer, FileProvider};
pub use crate::error::{Error, Result};
pub use crate::kind::BackendKind;
