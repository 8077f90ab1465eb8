//! The uniform contract every blob backend honours.

use std::fmt;
use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

use crate::channel::{BlobChannel, ChannelIo, StoreChannel};
use crate::error::{Error, Result};
use crate::kind::BackendKind;
use crate::scoped::TempFileProvider;

/// Materialized content handed out by [`BlobContainer::data`].
///
/// Heap-like backends lend their storage; the disk backend shares its cached
/// copy; everything else builds a fresh vector.
#[derive(Debug, Clone)]
pub enum BlobBytes<'a> {
    Borrowed(&'a [u8]),
    Owned(Vec<u8>),
    Shared(Arc<[u8]>),
}

impl BlobBytes<'_> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            BlobBytes::Borrowed(b) => b,
            BlobBytes::Owned(v) => v,
            BlobBytes::Shared(a) => a,
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        match self {
            BlobBytes::Borrowed(b) => b.to_vec(),
            BlobBytes::Owned(v) => v,
            BlobBytes::Shared(a) => a.to_vec(),
        }
    }
}

impl Deref for BlobBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// A mutable view that stays tied to the backend while it is alive
/// (a locked native region, a memory-mapped file).
pub trait BufferView: DerefMut<Target = [u8]> {}

impl<T: DerefMut<Target = [u8]>> BufferView for T {}

/// Buffer view returned by [`BlobContainer::data_buffer`].
///
/// `Slice` and `View` write through to the backend. `Detached` is a copy:
/// mutating it does not touch stored content, which is what
/// [`BlobContainer::supports_direct_mutation`] reports.
pub enum DataBuffer<'a> {
    Slice(&'a mut [u8]),
    Detached(Vec<u8>),
    View(Box<dyn BufferView + 'a>),
}

impl DataBuffer<'_> {
    pub fn is_detached(&self) -> bool {
        matches!(self, DataBuffer::Detached(_))
    }
}

impl fmt::Debug for DataBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self {
            DataBuffer::Slice(_) => "Slice",
            DataBuffer::Detached(_) => "Detached",
            DataBuffer::View(_) => "View",
        };
        f.debug_struct("DataBuffer")
            .field("variant", &variant)
            .field("len", &self.len())
            .finish()
    }
}

impl Deref for DataBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            DataBuffer::Slice(s) => s,
            DataBuffer::Detached(v) => v,
            DataBuffer::View(view) => view,
        }
    }
}

impl DerefMut for DataBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            DataBuffer::Slice(s) => s,
            DataBuffer::Detached(v) => v,
            DataBuffer::View(view) => view,
        }
    }
}

/// Scoped filesystem path holding the blob's content.
///
/// Closing (or dropping) the provider folds any on-disk change back into the
/// owning container. Close errors are only observable through [`close`].
///
/// [`close`]: FileProvider::close
pub trait FileProvider: Send {
    fn path(&self) -> &Path;

    fn close(self: Box<Self>) -> Result<()>;
}

/// Storage backend for one payload.
///
/// Backends implement a small positional core (`read_at`, `write_at`,
/// `truncate`, `reset`); channels, serialization and scoped file access are
/// layered on top of it. A container is exclusively owned and not shared
/// across threads without external synchronization.
pub trait BlobContainer: Send + fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Content length in bytes.
    fn length(&self) -> u64;

    /// Legacy 32-bit length accessor, clamped to `i32::MAX`.
    fn data_length(&self) -> i32 {
        i32::try_from(self.length()).unwrap_or(i32::MAX)
    }

    /// Full content. Backends that cannot materialize their size fail with
    /// [`Error::MaterializationTooLarge`] rather than truncating.
    fn data(&mut self) -> Result<BlobBytes<'_>>;

    /// Replace content. `None` means empty.
    fn set_data(&mut self, data: Option<Vec<u8>>) -> Result<()>;

    /// Replace content with `data[offset..offset + length]`.
    fn set_data_range(&mut self, data: Option<&[u8]>, offset: usize, length: usize) -> Result<()> {
        match data {
            None => self.set_data(None),
            Some(src) => {
                let slice = checked_range(src, offset, length)?;
                self.set_data(Some(slice.to_vec()))
            }
        }
    }

    fn data_buffer(&mut self) -> Result<DataBuffer<'_>>;

    /// Whether writes through [`data_buffer`](BlobContainer::data_buffer)
    /// reach stored content.
    fn supports_direct_mutation(&self) -> bool {
        true
    }

    /// Read up to `dst.len()` bytes at `position`; `Ok(0)` at or past the end.
    fn read_at(&mut self, position: u64, dst: &mut [u8]) -> Result<usize>;

    /// Write `src` at `position`, zero-filling any gap past the current end.
    fn write_at(&mut self, position: u64, src: &[u8]) -> Result<usize>;

    /// Shrink content to `size`; callers guarantee `size < length()`.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Discard content and prepare for roughly `estimated_size` bytes.
    fn reset(&mut self, estimated_size: u64) -> Result<()>;

    /// Channel over existing content, positioned at zero.
    fn channel(&mut self) -> Result<Box<dyn BlobChannel + '_>> {
        Ok(Box::new(StoreChannel::new(self)))
    }

    /// Channel over fresh, empty content sized for `estimated_size`.
    fn new_channel(&mut self, estimated_size: u64) -> Result<Box<dyn BlobChannel + '_>> {
        self.reset(estimated_size)?;
        self.channel()
    }

    /// Independent read-only stream over current content.
    fn reader(&self) -> Result<Box<dyn Read + Send + '_>>;

    /// Deep, independent copy of this container, same backend kind.
    fn try_clone(&self) -> Result<Box<dyn BlobContainer>>;

    fn file_provider(&mut self) -> Result<Box<dyn FileProvider + '_>> {
        Ok(Box::new(TempFileProvider::acquire(self)?))
    }

    /// Drop any cached materialization; the next `data()` reads fresh.
    fn invalidate_cache(&mut self) {}

    /// Stream content to `out`; returns the number of bytes written.
    fn write_to(&self, out: &mut dyn Write) -> Result<u64> {
        let mut reader = self.reader()?;
        io::copy(&mut reader, out).map_err(|e| Error::from_io("write_to", e))
    }

    /// Replace content with everything `input` yields.
    fn read_from(&mut self, input: &mut dyn Read, estimated_size: u64) -> Result<u64> {
        let mut channel = self.new_channel(estimated_size)?;
        let copied = io::copy(input, &mut ChannelIo::new(&mut *channel))
            .map_err(|e| Error::from_io("read_from", e))?;
        channel.close()?;
        Ok(copied)
    }
}

/// Copy all of `src` into `dst`, replacing whatever `dst` held.
pub fn copy_content<S, D>(src: &S, dst: &mut D) -> Result<u64>
where
    S: BlobContainer + ?Sized,
    D: BlobContainer + ?Sized,
{
    let mut reader = src.reader()?;
    dst.read_from(&mut reader, src.length())
}

/// Bounds-checked `src[offset..offset + length]`.
pub fn checked_range(src: &[u8], offset: usize, length: usize) -> Result<&[u8]> {
    let invalid = || Error::InvalidRange {
        offset,
        length,
        available: src.len(),
    };
    let end = offset.checked_add(length).ok_or_else(invalid)?;
    src.get(offset..end).ok_or_else(invalid)
}

/// Convert a 64-bit position into a slice index for in-memory backends.
pub fn to_index(position: u64) -> Result<usize> {
    usize::try_from(position).map_err(|_| Error::Alloc { bytes: position })
}
