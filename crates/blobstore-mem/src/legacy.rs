//! Legacy Wrapper: adapts the old whole-array container contract.
//!
//! Older containers only know how to hand out and replace their full content.
//! [`LegacyAdapter`] expresses every positional operation as a
//! read-modify-replace against that narrow contract, leaving storage to the
//! wrapped container.

use std::fmt;
use std::io::{self, Read};

use blobstore_core::container::to_index;
use blobstore_core::prelude::*;

/// The narrow contract predating channels and positional access.
pub trait LegacyContainer: Send + fmt::Debug {
    fn data(&self) -> &[u8];

    fn set_data(&mut self, data: Vec<u8>);

    fn length(&self) -> usize {
        self.data().len()
    }

    fn duplicate(&self) -> Box<dyn LegacyContainer>;
}

impl LegacyContainer for Vec<u8> {
    fn data(&self) -> &[u8] {
        self
    }

    fn set_data(&mut self, data: Vec<u8>) {
        *self = data;
    }

    fn duplicate(&self) -> Box<dyn LegacyContainer> {
        Box::new(self.clone())
    }
}

#[derive(Debug)]
pub struct LegacyAdapter<L: LegacyContainer> {
    inner: L,
}

impl<L: LegacyContainer> LegacyAdapter<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

impl<L: LegacyContainer + 'static> BlobContainer for LegacyAdapter<L> {
    fn kind(&self) -> BackendKind {
        BackendKind::Legacy
    }

    fn length(&self) -> u64 {
        self.inner.length() as u64
    }

    fn data(&mut self) -> Result<BlobBytes<'_>> {
        Ok(BlobBytes::Borrowed(self.inner.data()))
    }

    fn set_data(&mut self, data: Option<Vec<u8>>) -> Result<()> {
        self.inner.set_data(data.unwrap_or_default());
        Ok(())
    }

    fn data_buffer(&mut self) -> Result<DataBuffer<'_>> {
        Ok(DataBuffer::Detached(self.inner.data().to_vec()))
    }

    fn supports_direct_mutation(&self) -> bool {
        false
    }

    fn read_at(&mut self, position: u64, dst: &mut [u8]) -> Result<usize> {
        let bytes = self.inner.data();
        let start = usize::try_from(position).unwrap_or(usize::MAX).min(bytes.len());
        let n = dst.len().min(bytes.len() - start);
        dst[..n].copy_from_slice(&bytes[start..start + n]);
        Ok(n)
    }

    fn write_at(&mut self, position: u64, src: &[u8]) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let start = to_index(position)?;
        let end = start.checked_add(src.len()).ok_or(Error::Alloc {
            bytes: position.saturating_add(src.len() as u64),
        })?;
        let mut bytes = self.inner.data().to_vec();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        self.inner.set_data(bytes);
        Ok(src.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        let size = to_index(size)?;
        if size < self.inner.length() {
            let kept = self.inner.data()[..size].to_vec();
            self.inner.set_data(kept);
        }
        Ok(())
    }

    fn reset(&mut self, _estimated_size: u64) -> Result<()> {
        self.inner.set_data(Vec::new());
        Ok(())
    }

    fn reader(&self) -> Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(io::Cursor::new(self.inner.data())))
    }

    fn try_clone(&self) -> Result<Box<dyn BlobContainer>> {
        Ok(Box::new(LegacyAdapter {
            inner: self.inner.duplicate(),
        }))
    }
}

impl LegacyContainer for Box<dyn LegacyContainer> {
    fn data(&self) -> &[u8] {
        (**self).data()
    }

    fn set_data(&mut self, data: Vec<u8>) {
        (**self).set_data(data)
    }

    fn length(&self) -> usize {
        (**self).length()
    }

    fn duplicate(&self) -> Box<dyn LegacyContainer> {
        (**self).duplicate()
    }
}
