use std::io;

use thiserror::Error;

/// Canonical result for every blob operation.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for the blob store.
///
/// `Io`, `Alloc`, `Released` and `MaterializationTooLarge` are storage faults:
/// they are always surfaced to the caller and never retried internally.
/// `Config` and `NoBackendForSize` are configuration faults.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage I/O failed during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("native allocation of {bytes} bytes failed")]
    Alloc { bytes: u64 },

    #[error("data exceeds the maximum size configured for array usage, size={size} max={max}")]
    MaterializationTooLarge { size: u64, max: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no backend configured for size {size}; table: {table}")]
    NoBackendForSize { size: u64, table: String },

    #[error("range {offset}+{length} is outside a buffer of {available} bytes")]
    InvalidRange {
        offset: usize,
        length: usize,
        available: usize,
    },

    #[error("backing resource was already released")]
    Released,

    #[error("channel is closed")]
    ChannelClosed,
}

impl Error {
    /// Wrap an I/O failure with the operation that produced it.
    pub fn io(context: &'static str, source: io::Error) -> Self {
        Error::Io { context, source }
    }

    /// Like [`Error::io`], but recovers a blob error that travelled through a
    /// `std::io` adapter instead of nesting it.
    pub fn from_io(context: &'static str, source: io::Error) -> Self {
        if !source.get_ref().map_or(false, |inner| inner.is::<Error>()) {
            return Error::Io { context, source };
        }
        let kind = source.kind();
        let source = match source.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(own)) => return *own,
            Some(Err(other)) => io::Error::new(kind, other),
            None => io::Error::from(kind),
        };
        Error::Io { context, source }
    }

    /// True for faults raised by the storage medium rather than by configuration.
    pub fn is_storage_fault(&self) -> bool {
        !matches!(self, Error::Config(_) | Error::NoBackendForSize { .. })
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io { source, .. } => source,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}
