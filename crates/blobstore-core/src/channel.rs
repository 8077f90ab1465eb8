//! Mutation channels over blob content.
//!
//! Every backend exposes positional primitives (`read_at`, `write_at`,
//! `truncate`); [`StoreChannel`] turns them into a seekable cursor. The cursor
//! is generic over how it holds the store, so the same type serves a borrowed
//! backend (`&mut HeapBuffer`) and an owned one (`Box<dyn BlobContainer>`).
//!
//! [`ChannelWrapper`] decorates a real channel with an "on write or truncate"
//! hook and an "on close" hook. A write hook may hand back a replacement
//! channel, which the wrapper splices in place of the real one; callers keep
//! addressing the same wrapper across the swap.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::DerefMut;

use tracing::trace;

use crate::container::BlobContainer;
use crate::error::{Error, Result};

/// Read/seek/write/truncate/close over blob content.
///
/// `read` returns `Ok(0)` at end of data. Writes past the current size
/// zero-fill the gap.
pub trait BlobChannel: Send {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize>;

    fn write(&mut self, src: &[u8]) -> Result<usize>;

    fn position(&self) -> u64;

    fn seek(&mut self, position: u64) -> Result<()>;

    /// Current size of the content, not the position.
    fn size(&self) -> Result<u64>;

    /// Shrink to `size`. Growing through truncate is a no-op; the position
    /// is clamped to the new size either way.
    fn truncate(&mut self, size: u64) -> Result<()>;

    fn is_open(&self) -> bool;

    fn close(&mut self) -> Result<()>;

    fn write_all(&mut self, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let n = self.write(src)?;
            if n == 0 {
                return Err(Error::io(
                    "write_all",
                    io::Error::new(io::ErrorKind::WriteZero, "channel accepted no bytes"),
                ));
            }
            src = &src[n..];
        }
        Ok(())
    }
}

impl<C: BlobChannel + ?Sized> BlobChannel for Box<C> {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        (**self).read(dst)
    }
    fn write(&mut self, src: &[u8]) -> Result<usize> {
        (**self).write(src)
    }
    fn position(&self) -> u64 {
        (**self).position()
    }
    fn seek(&mut self, position: u64) -> Result<()> {
        (**self).seek(position)
    }
    fn size(&self) -> Result<u64> {
        (**self).size()
    }
    fn truncate(&mut self, size: u64) -> Result<()> {
        (**self).truncate(size)
    }
    fn is_open(&self) -> bool {
        (**self).is_open()
    }
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Seekable cursor over a backend's positional primitives.
#[derive(Debug)]
pub struct StoreChannel<S> {
    store: S,
    position: u64,
    open: bool,
}

impl<S> StoreChannel<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            position: 0,
            open: true,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::ChannelClosed)
        }
    }
}

impl<S, T> BlobChannel for StoreChannel<S>
where
    S: DerefMut<Target = T> + Send,
    T: BlobContainer + ?Sized,
{
    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let n = self.store.read_at(self.position, dst)?;
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, src: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let n = self.store.write_at(self.position, src)?;
        trace!(kind = %self.store.kind(), bytes = n, position = self.position, "channel write");
        self.position += n as u64;
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.ensure_open()?;
        self.position = position;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.store.length())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.ensure_open()?;
        if size < self.store.length() {
            self.store.truncate(size)?;
        }
        self.position = self.position.min(size);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

/// Invoked after a write or truncate with the real channel. Returning a
/// channel replaces the real one.
pub type ChannelHook<'a, C> = Box<dyn FnMut(&mut C) -> Result<Option<C>> + Send + 'a>;

/// Invoked after the real channel has closed.
pub type CloseHook<'a, C> = Box<dyn FnMut(&mut C) -> Result<()> + Send + 'a>;

/// Decorates a real channel with mutation and close notifications.
///
/// Hook errors are not contained: the real operation has already completed
/// when a hook runs, and the hook's error is returned to the caller.
pub struct ChannelWrapper<'a, C: BlobChannel> {
    base: C,
    on_write: Option<ChannelHook<'a, C>>,
    on_close: Option<CloseHook<'a, C>>,
}

impl<'a, C: BlobChannel> ChannelWrapper<'a, C> {
    pub fn new(base: C) -> Self {
        Self {
            base,
            on_write: None,
            on_close: None,
        }
    }

    /// Register the single write/truncate hook, replacing any previous one.
    pub fn set_write_hook(&mut self, hook: ChannelHook<'a, C>) {
        self.on_write = Some(hook);
    }

    /// Register the single close hook, replacing any previous one.
    pub fn set_close_hook(&mut self, hook: CloseHook<'a, C>) {
        self.on_close = Some(hook);
    }

    pub fn with_write_hook(mut self, hook: ChannelHook<'a, C>) -> Self {
        self.set_write_hook(hook);
        self
    }

    pub fn with_close_hook(mut self, hook: CloseHook<'a, C>) -> Self {
        self.set_close_hook(hook);
        self
    }

    /// Swap the wrapped channel. The previous channel is returned untouched.
    pub fn replace_base(&mut self, replacement: C) -> C {
        std::mem::replace(&mut self.base, replacement)
    }

    pub fn base(&self) -> &C {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut C {
        &mut self.base
    }

    pub fn into_base(self) -> C {
        self.base
    }

    fn fire_write(&mut self) -> Result<()> {
        let replacement = match self.on_write.as_mut() {
            Some(hook) => hook(&mut self.base)?,
            None => None,
        };
        if let Some(next) = replacement {
            drop(self.replace_base(next));
        }
        Ok(())
    }
}

impl<C: BlobChannel> BlobChannel for ChannelWrapper<'_, C> {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.base.read(dst)
    }

    fn write(&mut self, src: &[u8]) -> Result<usize> {
        let n = self.base.write(src)?;
        self.fire_write()?;
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.base.position()
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.base.seek(position)
    }

    fn size(&self) -> Result<u64> {
        self.base.size()
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.base.truncate(size)?;
        self.fire_write()
    }

    fn is_open(&self) -> bool {
        self.base.is_open()
    }

    fn close(&mut self) -> Result<()> {
        if !self.base.is_open() {
            return Ok(());
        }
        let closed = self.base.close();
        let hooked = match self.on_close.as_mut() {
            Some(hook) => hook(&mut self.base),
            None => Ok(()),
        };
        closed?;
        hooked
    }
}

/// `std::io` view of a channel, for `io::copy` and friends.
pub struct ChannelIo<'c, C: BlobChannel + ?Sized>(pub &'c mut C);

impl<'c, C: BlobChannel + ?Sized> ChannelIo<'c, C> {
    pub fn new(channel: &'c mut C) -> Self {
        Self(channel)
    }
}

impl<C: BlobChannel + ?Sized> Read for ChannelIo<'_, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).map_err(io::Error::from)
    }
}

impl<C: BlobChannel + ?Sized> Write for ChannelIo<'_, C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<C: BlobChannel + ?Sized> Seek for ChannelIo<'_, C> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.0.size().map_err(io::Error::from)?.checked_add_signed(d),
            SeekFrom::Current(d) => self.0.position().checked_add_signed(d),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of channel")
        })?;
        self.0.seek(target).map_err(io::Error::from)?;
        Ok(target)
    }
}

/// Copy everything from `src` (starting at its current position) into `dst`.
pub fn copy_channel<S, D>(src: &mut S, dst: &mut D) -> Result<u64>
where
    S: BlobChannel + ?Sized,
    D: BlobChannel + ?Sized,
{
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
}
