//! Heap Buffer: one contiguous vector.
//!
//! `data()` lends the live vector without copying; callers must not expect a
//! snapshot.

use std::io::{self, Read};

use blobstore_core::container::to_index;
use blobstore_core::prelude::*;

const RESERVE_HINT_CAP: usize = 64 * 1024 * 1024;

#[derive(Debug, Default, Clone)]
pub struct HeapBuffer {
    bytes: Vec<u8>,
}

impl HeapBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    fn ensure_len(&mut self, len: usize) -> Result<()> {
        if len > self.bytes.len() {
            self.bytes
                .try_reserve(len - self.bytes.len())
                .map_err(|_| Error::Alloc { bytes: len as u64 })?;
            self.bytes.resize(len, 0);
        }
        Ok(())
    }
}

impl BlobContainer for HeapBuffer {
    fn kind(&self) -> BackendKind {
        BackendKind::Heap
    }

    fn length(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn data(&mut self) -> Result<BlobBytes<'_>> {
        Ok(BlobBytes::Borrowed(&self.bytes))
    }

    fn set_data(&mut self, data: Option<Vec<u8>>) -> Result<()> {
        self.bytes = data.unwrap_or_default();
        Ok(())
    }

    fn data_buffer(&mut self) -> Result<DataBuffer<'_>> {
        Ok(DataBuffer::Slice(&mut self.bytes))
    }

    fn read_at(&mut self, position: u64, dst: &mut [u8]) -> Result<usize> {
        let len = self.bytes.len();
        let start = usize::try_from(position).unwrap_or(usize::MAX).min(len);
        let n = dst.len().min(len - start);
        dst[..n].copy_from_slice(&self.bytes[start..start + n]);
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
        self.ensure_len(end)?;
        self.bytes[start..end].copy_from_slice(src);
        Ok(src.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.bytes.truncate(to_index(size)?);
        Ok(())
    }

    fn reset(&mut self, estimated_size: u64) -> Result<()> {
        let mut fresh = Vec::new();
        // The estimate is only a hint; a failed reservation is not fatal.
        let hint = usize::try_from(estimated_size).unwrap_or(0).min(RESERVE_HINT_CAP);
        let _ = fresh.try_reserve(hint);
        self.bytes = fresh;
        Ok(())
    }

    fn reader(&self) -> Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(io::Cursor::new(self.bytes.as_slice())))
    }

    fn try_clone(&self) -> Result<Box<dyn BlobContainer>> {
        Ok(Box::new(self.clone()))
    }
}
