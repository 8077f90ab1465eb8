//! Native Backend: off-heap memory with manual allocate/grow/free.
//!
//! The allocation lives in a [`NativeSlot`] shared with the native
//! [`Reclaimer`]. Dropping a [`NativeBuffer`] abandons its registration, which
//! frees the memory at once (or via the reaper while one runs); the shutdown
//! sweep frees whatever is left. Once a
//! slot has been released every operation on its buffer fails with
//! [`Error::Released`].

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use blobstore_core::container::to_index;
use blobstore_core::prelude::*;

use crate::alloc::{NativeAllocator, NativeRegion, SystemAllocator};
use crate::monitor::{self, LiveStats};
use crate::reclaim::{Reclaim, ReclaimHandle, Reclaimer};

/// Old content moves into a grown region in strides of this size.
const COPY_STRIDE: usize = 1024;

/// Below this capacity growth is additive rather than doubling.
const SMALL_CAPACITY: usize = 100;

static RECLAIMER: Lazy<Reclaimer<NativeSlot>> = Lazy::new(|| Reclaimer::new("native"));

/// Process-wide reclaimer for native buffers.
pub fn reclaimer() -> &'static Reclaimer<NativeSlot> {
    &RECLAIMER
}

#[derive(Debug, Default)]
struct NativeState {
    region: Option<NativeRegion>,
    length: usize,
    released: bool,
}

impl NativeState {
    fn capacity(&self) -> usize {
        self.region.as_ref().map_or(0, NativeRegion::capacity)
    }

    fn bytes(&self) -> &[u8] {
        match &self.region {
            Some(r) => &r.as_slice()[..self.length],
            None => &[],
        }
    }

    fn live_mut(&mut self) -> &mut [u8] {
        let length = self.length;
        match self.region.as_mut() {
            Some(r) => &mut r.as_mut_slice()[..length],
            None => &mut [],
        }
    }
}

/// The reclaimable part of a native buffer.
pub struct NativeSlot {
    allocator: Arc<dyn NativeAllocator>,
    state: Mutex<NativeState>,
}

impl NativeSlot {
    fn lock(&self) -> Result<MutexGuard<'_, NativeState>> {
        let guard = self.state.lock();
        if guard.released {
            return Err(Error::Released);
        }
        Ok(guard)
    }

    fn allocate(&self, capacity: usize) -> Result<Option<NativeRegion>> {
        if capacity == 0 {
            return Ok(None);
        }
        NativeRegion::allocate(Arc::clone(&self.allocator), capacity).map(Some)
    }
}

impl Reclaim for NativeSlot {
    fn release(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.released {
            return Ok(());
        }
        state.released = true;
        state.length = 0;
        drop(state.region.take());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("native region of {} bytes", self.state.lock().capacity())
    }
}

impl fmt::Debug for NativeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NativeSlot")
            .field("length", &state.length)
            .field("capacity", &state.capacity())
            .field("released", &state.released)
            .finish()
    }
}

/// Capacity after growing `old` to fit `needed` more bytes ending at `end`.
fn grown_capacity(old: usize, needed: usize, end: usize) -> Result<usize> {
    let overflow = || Error::Alloc { bytes: end as u64 };
    let mut cap = if old < SMALL_CAPACITY {
        old.checked_add(needed).ok_or_else(overflow)?
    } else {
        old.checked_mul(2).ok_or_else(overflow)?
    };
    cap = cap.max(1);
    while cap < end {
        cap = cap.checked_mul(2).ok_or_else(overflow)?;
    }
    if cap > isize::MAX as usize {
        return Err(overflow());
    }
    Ok(cap)
}

#[derive(Debug)]
pub struct NativeBuffer {
    slot: Arc<NativeSlot>,
    reclaimer: Reclaimer<NativeSlot>,
    stats: Arc<LiveStats>,
    _handle: ReclaimHandle,
}

impl NativeBuffer {
    /// Empty buffer on the system allocator, tracked by the global reclaimer.
    pub fn new() -> Self {
        Self::with_parts(Arc::new(SystemAllocator), reclaimer())
    }

    pub fn with_parts(allocator: Arc<dyn NativeAllocator>, reclaimer: &Reclaimer<NativeSlot>) -> Self {
        let slot = Arc::new(NativeSlot {
            allocator,
            state: Mutex::new(NativeState::default()),
        });
        let handle = reclaimer.register(Arc::clone(&slot));
        Self {
            slot,
            reclaimer: reclaimer.clone(),
            stats: monitor::global().track(BackendKind::Native),
            _handle: handle,
        }
    }

    /// Allocated bytes; never shrinks on truncate.
    pub fn capacity(&self) -> Result<usize> {
        Ok(self.slot.lock()?.capacity())
    }

    pub fn is_released(&self) -> bool {
        self.slot.state.lock().released
    }

    fn publish(&self, length: usize) {
        self.stats.set_length(length as u64);
    }
}

impl Default for NativeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobContainer for NativeBuffer {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn length(&self) -> u64 {
        self.slot.state.lock().length as u64
    }

    fn data(&mut self) -> Result<BlobBytes<'_>> {
        Ok(BlobBytes::Owned(self.slot.lock()?.bytes().to_vec()))
    }

    fn set_data(&mut self, data: Option<Vec<u8>>) -> Result<()> {
        let bytes = data.unwrap_or_default();
        // Allocate before freeing so a failure leaves the old content intact.
        let mut region = self.slot.allocate(bytes.len())?;
        if let Some(r) = region.as_mut() {
            r.as_mut_slice().copy_from_slice(&bytes);
        }
        let mut state = self.slot.lock()?;
        state.region = region;
        state.length = bytes.len();
        drop(state);
        self.publish(bytes.len());
        Ok(())
    }

    fn data_buffer(&mut self) -> Result<DataBuffer<'_>> {
        let state = self.slot.lock()?;
        if state.region.is_none() {
            return Ok(DataBuffer::Detached(Vec::new()));
        }
        let view = MutexGuard::map(state, NativeState::live_mut);
        Ok(DataBuffer::View(Box::new(view)))
    }

    fn read_at(&mut self, position: u64, dst: &mut [u8]) -> Result<usize> {
        let state = self.slot.lock()?;
        let bytes = state.bytes();
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

        let mut state = self.slot.lock()?;
        let old_cap = state.capacity();
        if end > old_cap {
            let new_cap = grown_capacity(old_cap, src.len(), end)?;
            let mut grown = self.slot.allocate(new_cap)?;
            if let (Some(new), Some(old)) = (grown.as_mut(), state.region.as_ref()) {
                let live = &old.as_slice()[..state.length];
                for (to, from) in new
                    .as_mut_slice()
                    .chunks_mut(COPY_STRIDE)
                    .zip(live.chunks(COPY_STRIDE))
                {
                    to[..from.len()].copy_from_slice(from);
                }
            }
            debug!(old_cap, new_cap, "native region grown");
            state.region = grown;
        }

        let length = state.length;
        if let Some(region) = state.region.as_mut() {
            let buf = region.as_mut_slice();
            if start > length {
                // Stale bytes may remain past the length after a truncate.
                buf[length..start].fill(0);
            }
            buf[start..end].copy_from_slice(src);
        }
        state.length = length.max(end);
        let new_len = state.length;
        drop(state);
        trace!(position, bytes = src.len(), "native write");
        self.publish(new_len);
        Ok(src.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        let mut state = self.slot.lock()?;
        let size = usize::try_from(size).unwrap_or(usize::MAX);
        state.length = state.length.min(size);
        let length = state.length;
        drop(state);
        self.publish(length);
        Ok(())
    }

    fn reset(&mut self, estimated_size: u64) -> Result<()> {
        let estimate = usize::try_from(estimated_size).map_err(|_| Error::Alloc {
            bytes: estimated_size,
        })?;
        let capacity = estimate
            .checked_add(estimate / 5)
            .ok_or(Error::Alloc { bytes: estimated_size })?;
        let region = self.slot.allocate(capacity)?;
        let mut state = self.slot.lock()?;
        state.region = region;
        state.length = 0;
        drop(state);
        self.publish(0);
        Ok(())
    }

    fn reader(&self) -> Result<Box<dyn Read + Send + '_>> {
        // Fail early if the region is already gone.
        drop(self.slot.lock()?);
        Ok(Box::new(NativeReader {
            slot: Arc::clone(&self.slot),
            position: 0,
        }))
    }

    fn try_clone(&self) -> Result<Box<dyn BlobContainer>> {
        let copy = self.slot.lock()?.bytes().to_vec();
        let mut clone = NativeBuffer::with_parts(Arc::clone(&self.slot.allocator), &self.reclaimer);
        clone.set_data(Some(copy))?;
        Ok(Box::new(clone))
    }
}

struct NativeReader {
    slot: Arc<NativeSlot>,
    position: usize,
}

impl Read for NativeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.slot.lock()?;
        let bytes = state.bytes();
        let start = self.position.min(bytes.len());
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        self.position += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::CountingAllocator;

    fn counted() -> (NativeBuffer, Arc<CountingAllocator>, Reclaimer<NativeSlot>) {
        let counting = Arc::new(CountingAllocator::new());
        let reclaimer = Reclaimer::new("native-test");
        let buf = NativeBuffer::with_parts(counting.clone(), &reclaimer);
        (buf, counting, reclaimer)
    }

    #[test]
    fn grow_rule() {
        assert_eq!(grown_capacity(0, 5, 5).unwrap(), 5);
        assert_eq!(grown_capacity(10, 5, 15).unwrap(), 15);
        assert_eq!(grown_capacity(10, 5, 100).unwrap(), 120);
        assert_eq!(grown_capacity(200, 1, 201).unwrap(), 400);
        assert_eq!(grown_capacity(200, 1000, 1200).unwrap(), 1600);
        assert!(grown_capacity(usize::MAX / 2 + 1, 1, usize::MAX).is_err());
    }

    #[test]
    fn set_data_allocates_exactly_and_frees_previous() {
        let (mut buf, counting, _reclaimer) = counted();
        buf.set_data(Some(b"hello".to_vec())).unwrap();
        assert_eq!(buf.capacity().unwrap(), 5);
        buf.set_data(Some(b"hi".to_vec())).unwrap();
        assert_eq!(buf.capacity().unwrap(), 2);
        let stats = counting.stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.frees, 1);
        assert_eq!(&*buf.data().unwrap(), b"hi");
    }

    #[test]
    fn growth_preserves_content_across_strides() {
        let (mut buf, _counting, _reclaimer) = counted();
        let first: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        buf.write_at(0, &first).unwrap();
        buf.write_at(3000, b"tail").unwrap();
        let data = buf.data().unwrap().into_vec();
        assert_eq!(&data[..3000], &first[..]);
        assert_eq!(&data[3000..], b"tail");
        assert!(buf.capacity().unwrap() >= 3004);
    }

    #[test]
    fn truncate_keeps_capacity_and_gap_reads_zero() {
        let (mut buf, _counting, _reclaimer) = counted();
        buf.set_data(Some(b"abcdefgh".to_vec())).unwrap();
        buf.truncate(2).unwrap();
        assert_eq!(buf.capacity().unwrap(), 8);
        assert_eq!(buf.length(), 2);
        buf.write_at(5, b"Z").unwrap();
        assert_eq!(&*buf.data().unwrap(), b"ab\0\0\0Z");
    }

    #[test]
    fn new_channel_preallocates_with_headroom() {
        let (mut buf, _counting, _reclaimer) = counted();
        let mut ch = buf.new_channel(100).unwrap();
        ch.write_all(b"x").unwrap();
        drop(ch);
        assert_eq!(buf.capacity().unwrap(), 120);
        assert_eq!(buf.length(), 1);
    }

    #[test]
    fn data_buffer_writes_through() {
        let (mut buf, _counting, _reclaimer) = counted();
        buf.set_data(Some(b"abc".to_vec())).unwrap();
        {
            let mut view = buf.data_buffer().unwrap();
            assert_eq!(view.len(), 3);
            view[1] = b'X';
        }
        assert_eq!(&*buf.data().unwrap(), b"aXc");
    }

    #[test]
    fn dropped_buffer_freed_exactly_once() {
        let (mut buf, counting, reclaimer) = counted();
        buf.set_data(Some(vec![1u8; 64])).unwrap();
        drop(buf);
        assert_eq!(counting.stats().frees, 1);
        assert_eq!(reclaimer.pending_count(), 0);
        assert_eq!(reclaimer.reap_ready(), 0);
        assert_eq!(reclaimer.shutdown_sweep(), 0);
        let stats = counting.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.invalid_frees, 0);
        assert_eq!(counting.live_allocations(), 0);
    }

    #[test]
    fn sweep_under_live_buffer_reports_released() {
        let (mut buf, counting, reclaimer) = counted();
        buf.set_data(Some(b"data".to_vec())).unwrap();
        assert_eq!(reclaimer.shutdown_sweep(), 1);
        assert!(buf.is_released());
        assert!(matches!(buf.data(), Err(Error::Released)));
        assert!(matches!(buf.write_at(0, b"x"), Err(Error::Released)));
        drop(buf);
        assert_eq!(reclaimer.reap_ready(), 0);
        assert_eq!(counting.stats().frees, 1);
    }

    #[test]
    fn clone_has_its_own_region() {
        let (mut buf, counting, _reclaimer) = counted();
        buf.set_data(Some(b"orig".to_vec())).unwrap();
        let mut copy = buf.try_clone().unwrap();
        buf.write_at(0, b"XX").unwrap();
        assert_eq!(&*copy.data().unwrap(), b"orig");
        assert_eq!(counting.stats().allocations, 2);
    }
}
