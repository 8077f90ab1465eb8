//! Chunked Heap Buffer: an ordered run of fixed-size chunks.
//!
//! Position `p` lives in chunk `p / chunk_size` at offset `p % chunk_size`.
//! Every chunk but the last is full; the last one only grows as far as bytes
//! are actually written, so nothing is pre-zeroed.

use std::io::{self, Read};

use blobstore_core::config::ADDRESSABLE_LIMIT;
use blobstore_core::prelude::*;

pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ChunkedBuffer {
    chunks: Vec<Vec<u8>>,
    length: u64,
    chunk_size: usize,
    materialize_limit: u64,
}

impl Default for ChunkedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedBuffer {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Smaller chunks are useful for exercising boundaries.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunks: Vec::new(),
            length: 0,
            chunk_size: chunk_size.max(1),
            materialize_limit: ADDRESSABLE_LIMIT,
        }
    }

    /// Cap for `data()` / `data_buffer()`; longer content fails loudly.
    pub fn with_materialize_limit(mut self, limit: u64) -> Self {
        self.materialize_limit = limit;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn split(&self, position: u64) -> (usize, usize) {
        let cs = self.chunk_size as u64;
        ((position / cs) as usize, (position % cs) as usize)
    }

    /// Zero-extend content to `target` bytes. Sizes that can never be held
    /// fail before any padding happens; a failure part way leaves the length
    /// unchanged.
    fn extend_to(&mut self, target: u64) -> Result<()> {
        if target <= self.length {
            return Ok(());
        }
        if target > ADDRESSABLE_LIMIT {
            return Err(Error::Alloc { bytes: target });
        }
        let slots = usize::try_from(target.div_ceil(self.chunk_size as u64))
            .map_err(|_| Error::Alloc { bytes: target })?;
        self.chunks
            .try_reserve(slots.saturating_sub(self.chunks.len()))
            .map_err(|_| Error::Alloc { bytes: target })?;

        let before = self.length;
        if let Err(e) = self.pad(target) {
            self.truncate(before)?;
            self.chunks
                .truncate(before.div_ceil(self.chunk_size as u64) as usize);
            return Err(e);
        }
        Ok(())
    }

    fn pad(&mut self, target: u64) -> Result<()> {
        while self.length < target {
            let fits = self
                .chunks
                .last()
                .map_or(false, |c| c.len() < self.chunk_size);
            if !fits {
                self.chunks.push(Vec::new());
            }
            let chunk_size = self.chunk_size;
            let last = match self.chunks.last_mut() {
                Some(c) => c,
                None => return Err(Error::Alloc { bytes: target }),
            };
            let room = (chunk_size - last.len()) as u64;
            let grow = room.min(target - self.length) as usize;
            last.try_reserve_exact(grow)
                .map_err(|_| Error::Alloc { bytes: target })?;
            last.resize(last.len() + grow, 0);
            self.length += grow as u64;
        }
        Ok(())
    }

    fn check_materializable(&self) -> Result<usize> {
        if self.length > self.materialize_limit {
            return Err(Error::MaterializationTooLarge {
                size: self.length,
                max: self.materialize_limit,
            });
        }
        usize::try_from(self.length).map_err(|_| Error::MaterializationTooLarge {
            size: self.length,
            max: usize::MAX as u64,
        })
    }

    fn materialize(&self) -> Result<Vec<u8>> {
        let len = self.check_materializable()?;
        let mut out = Vec::new();
        out.try_reserve_exact(len)
            .map_err(|_| Error::Alloc { bytes: len as u64 })?;
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }
}

impl BlobContainer for ChunkedBuffer {
    fn kind(&self) -> BackendKind {
        BackendKind::Chunked
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn data(&mut self) -> Result<BlobBytes<'_>> {
        Ok(BlobBytes::Owned(self.materialize()?))
    }

    fn set_data(&mut self, data: Option<Vec<u8>>) -> Result<()> {
        let mut fresh = ChunkedBuffer::with_chunk_size(self.chunk_size)
            .with_materialize_limit(self.materialize_limit);
        if let Some(bytes) = data {
            fresh.write_at(0, &bytes)?;
        }
        *self = fresh;
        Ok(())
    }

    fn data_buffer(&mut self) -> Result<DataBuffer<'_>> {
        Ok(DataBuffer::Detached(self.materialize()?))
    }

    fn supports_direct_mutation(&self) -> bool {
        false
    }

    fn read_at(&mut self, position: u64, dst: &mut [u8]) -> Result<usize> {
        if position >= self.length || dst.is_empty() {
            return Ok(0);
        }
        let want = (self.length - position).min(dst.len() as u64) as usize;
        let (mut idx, mut off) = self.split(position);
        let mut done = 0;
        while done < want {
            let chunk = &self.chunks[idx];
            let n = (chunk.len() - off).min(want - done);
            dst[done..done + n].copy_from_slice(&chunk[off..off + n]);
            done += n;
            idx += 1;
            off = 0;
        }
        Ok(done)
    }

    fn write_at(&mut self, position: u64, src: &[u8]) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let end = position
            .checked_add(src.len() as u64)
            .ok_or(Error::Alloc { bytes: u64::MAX })?;
        // Pad the gap first so reads see zeros, then cover the payload range.
        self.extend_to(end)?;
        let (mut idx, mut off) = self.split(position);
        let mut done = 0;
        while done < src.len() {
            let chunk = &mut self.chunks[idx];
            let n = (chunk.len() - off).min(src.len() - done);
            chunk[off..off + n].copy_from_slice(&src[done..done + n]);
            done += n;
            idx += 1;
            off = 0;
        }
        Ok(done)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        if size >= self.length {
            return Ok(());
        }
        let cs = self.chunk_size as u64;
        let keep = size.div_ceil(cs) as usize;
        self.chunks.truncate(keep);
        if let Some(last) = self.chunks.last_mut() {
            let tail = (size - (keep as u64 - 1) * cs) as usize;
            last.truncate(tail);
        }
        self.length = size;
        Ok(())
    }

    fn reset(&mut self, _estimated_size: u64) -> Result<()> {
        self.chunks.clear();
        self.length = 0;
        Ok(())
    }

    fn reader(&self) -> Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(ChunkReader {
            chunks: &self.chunks,
            index: 0,
            offset: 0,
        }))
    }

    fn try_clone(&self) -> Result<Box<dyn BlobContainer>> {
        Ok(Box::new(self.clone()))
    }
}

struct ChunkReader<'a> {
    chunks: &'a [Vec<u8>],
    index: usize,
    offset: usize,
}

impl Read for ChunkReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some(chunk) = self.chunks.get(self.index) {
            if self.offset < chunk.len() {
                let n = (chunk.len() - self.offset).min(buf.len());
                buf[..n].copy_from_slice(&chunk[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }
            self.index += 1;
            self.offset = 0;
        }
        Ok(0)
    }
}
