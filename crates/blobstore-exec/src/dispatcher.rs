//! Adaptive Dispatcher.
//!
//! A [`Blob`] owns exactly one active backend and implements the container
//! contract by delegating to it. Two things change the active backend:
//!
//! - Wholesale replacement (`set_data`, `new_channel`) picks the kind for the
//!   new size. `set_data` fills the fresh backend before dropping the old one;
//!   [`Blob::switch_to_appropriate`] (used by `reset`) simply drops it.
//! - Positional writes that extend the content, and truncation, re-check the
//!   table and carry the surviving content over when the kind changes.
//! - Live migration while a channel is open: after every write or truncate the
//!   target kind is recomputed from `max(size * 0.8, estimate)`. When it
//!   changes, content is copied into a new backend and the new backend's
//!   channel is spliced into the wrapper the caller already holds.
//!
//! While a [`DispatchChannel`] is open the backend is moved out of the blob and
//! into the channel; closing or dropping the channel puts whichever backend is
//! active at that point back.

use std::backtrace::Backtrace;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use blobstore_core::prelude::*;
use blobstore_core::{copy_channel, ChannelHook, PayloadConfig, ThresholdTable};
use blobstore_mem::HeapBuffer;

use crate::factory::BackendFactory;

type Backend = Box<dyn BlobContainer>;
type BackendChannel = StoreChannel<Backend>;

/// `size * 0.8` without floating point or overflow.
fn damped(size: u64) -> u64 {
    size / 5 * 4 + size % 5 * 4 / 5
}

#[derive(Debug)]
pub struct Blob {
    backend: Backend,
    factory: Arc<BackendFactory>,
    table: Arc<ThresholdTable>,
    max_array_length: u64,
    warn_array_length: u64,
    migrations: Arc<AtomicU64>,
}

impl Blob {
    /// Empty blob on whichever backend the table picks for size zero.
    pub fn new(factory: Arc<BackendFactory>) -> Result<Self> {
        let table = Arc::clone(factory.table());
        let backend = factory.create(table.resolve(0)?)?;
        let config = factory.config();
        Ok(Self {
            backend,
            max_array_length: config.max_array_length,
            warn_array_length: config.warn_array_length,
            factory,
            table,
            migrations: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn from_config(config: PayloadConfig) -> Result<Self> {
        Self::new(Arc::new(BackendFactory::new(config)?))
    }

    pub fn with_data(factory: Arc<BackendFactory>, data: Vec<u8>) -> Result<Self> {
        let mut blob = Self::new(factory)?;
        blob.set_data(Some(data))?;
        Ok(blob)
    }

    pub fn active_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Live migrations performed by channels opened on this blob.
    pub fn migrations(&self) -> u64 {
        self.migrations.load(Ordering::Acquire)
    }

    pub fn backend(&self) -> &dyn BlobContainer {
        self.backend.as_ref()
    }

    pub fn factory(&self) -> &Arc<BackendFactory> {
        &self.factory
    }

    /// Make the active backend the one the table picks for `expected_size`.
    /// A change discards current content. Returns whether a switch happened.
    pub fn switch_to_appropriate(&mut self, expected_size: u64) -> Result<bool> {
        let target = self.table.resolve(expected_size)?;
        let current = self.backend.kind();
        if target == current {
            return Ok(false);
        }
        debug!(from = %current, to = %target, expected_size, "switching backend");
        self.backend = self.factory.create(target)?;
        Ok(true)
    }

    /// Backend of kind `target` holding the first `keep` bytes of the active
    /// one. The active backend is left untouched.
    fn prepared(&self, target: BackendKind, keep: u64) -> Result<Backend> {
        let mut fresh = self.factory.create(target)?;
        if keep > 0 {
            let mut reader = self.backend.reader()?.take(keep);
            fresh.read_from(&mut reader, keep)?;
        }
        Ok(fresh)
    }

    fn adopt(&mut self, fresh: Backend, reason: &'static str) {
        debug!(from = %self.backend.kind(), to = %fresh.kind(), reason, "switching backend");
        self.backend = fresh;
    }

    /// `new_channel` without boxing, so the caller can watch the active
    /// kind while the channel is open.
    pub fn dispatch_channel(&mut self, estimated_size: u64) -> Result<DispatchChannel<'_>> {
        self.reset(estimated_size)?;
        Ok(self.open(estimated_size))
    }

    fn open(&mut self, estimate: u64) -> DispatchChannel<'_> {
        let hook = migration_hook(
            Arc::clone(&self.table),
            Arc::clone(&self.factory),
            Arc::clone(&self.migrations),
            estimate,
        );
        let backend = std::mem::replace(&mut self.backend, Box::new(HeapBuffer::new()));
        let inner = ChannelWrapper::new(StoreChannel::new(backend)).with_write_hook(hook);
        DispatchChannel {
            slot: &mut self.backend,
            inner: Some(inner),
        }
    }
}

impl BlobContainer for Blob {
    fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    fn length(&self) -> u64 {
        self.backend.length()
    }

    /// Enforces the hard ceiling, then the warning ceiling, then delegates.
    fn data(&mut self) -> Result<BlobBytes<'_>> {
        let size = self.backend.length();
        if size > self.max_array_length {
            return Err(Error::MaterializationTooLarge {
                size,
                max: self.max_array_length,
            });
        }
        if size > self.warn_array_length {
            let stack = Backtrace::force_capture();
            warn!(
                size,
                warn_array_length = self.warn_array_length,
                backtrace = %stack,
                "data() called for content exceeding the warning threshold"
            );
        }
        self.backend.data()
    }

    fn set_data(&mut self, data: Option<Vec<u8>>) -> Result<()> {
        let size = data.as_ref().map_or(0, |d| d.len() as u64);
        let target = self.table.resolve(size)?;
        if target == self.backend.kind() {
            return self.backend.set_data(data);
        }
        let mut fresh = self.prepared(target, 0)?;
        fresh.set_data(data)?;
        self.adopt(fresh, "set_data");
        Ok(())
    }

    fn set_data_range(&mut self, data: Option<&[u8]>, offset: usize, length: usize) -> Result<()> {
        let size = if data.is_some() { length as u64 } else { 0 };
        let target = self.table.resolve(size)?;
        if target == self.backend.kind() {
            return self.backend.set_data_range(data, offset, length);
        }
        let mut fresh = self.prepared(target, 0)?;
        fresh.set_data_range(data, offset, length)?;
        self.adopt(fresh, "set_data");
        Ok(())
    }

    fn data_buffer(&mut self) -> Result<DataBuffer<'_>> {
        self.backend.data_buffer()
    }

    fn supports_direct_mutation(&self) -> bool {
        self.backend.supports_direct_mutation()
    }

    fn read_at(&mut self, position: u64, dst: &mut [u8]) -> Result<usize> {
        self.backend.read_at(position, dst)
    }

    /// A write that extends the content migrates like an open channel with
    /// the current length as its estimate.
    fn write_at(&mut self, position: u64, src: &[u8]) -> Result<usize> {
        let length = self.backend.length();
        let end = position
            .checked_add(src.len() as u64)
            .ok_or(Error::Alloc { bytes: u64::MAX })?;
        if src.is_empty() || end <= length {
            return self.backend.write_at(position, src);
        }
        let target = self.table.resolve(damped(end).max(length))?;
        if target == self.backend.kind() {
            return self.backend.write_at(position, src);
        }
        let mut fresh = self.prepared(target, length)?;
        let written = fresh.write_at(position, src)?;
        self.adopt(fresh, "write_at");
        Ok(written)
    }

    /// Shrinking re-resolves the kind for the new length, as `set_data` would.
    fn truncate(&mut self, size: u64) -> Result<()> {
        let length = self.backend.length();
        if size >= length {
            return Ok(());
        }
        let target = self.table.resolve(size)?;
        if target == self.backend.kind() {
            return self.backend.truncate(size);
        }
        let fresh = self.prepared(target, size)?;
        self.adopt(fresh, "truncate");
        Ok(())
    }

    fn reset(&mut self, estimated_size: u64) -> Result<()> {
        self.switch_to_appropriate(estimated_size)?;
        self.backend.reset(estimated_size)
    }

    fn channel(&mut self) -> Result<Box<dyn BlobChannel + '_>> {
        let estimate = self.backend.length();
        Ok(Box::new(self.open(estimate)))
    }

    fn new_channel(&mut self, estimated_size: u64) -> Result<Box<dyn BlobChannel + '_>> {
        Ok(Box::new(self.dispatch_channel(estimated_size)?))
    }

    fn reader(&self) -> Result<Box<dyn Read + Send + '_>> {
        self.backend.reader()
    }

    fn try_clone(&self) -> Result<Box<dyn BlobContainer>> {
        Ok(Box::new(Blob {
            backend: self.backend.try_clone()?,
            factory: Arc::clone(&self.factory),
            table: Arc::clone(&self.table),
            max_array_length: self.max_array_length,
            warn_array_length: self.warn_array_length,
            migrations: Arc::new(AtomicU64::new(0)),
        }))
    }

    /// Scoped access goes to the active backend; a size change made through
    /// the file does not trigger a backend switch.
    fn file_provider(&mut self) -> Result<Box<dyn FileProvider + '_>> {
        self.backend.file_provider()
    }

    fn invalidate_cache(&mut self) {
        self.backend.invalidate_cache();
    }
}

fn migration_hook(
    table: Arc<ThresholdTable>,
    factory: Arc<BackendFactory>,
    migrations: Arc<AtomicU64>,
    estimate: u64,
) -> ChannelHook<'static, BackendChannel> {
    Box::new(
        move |real: &mut BackendChannel| -> Result<Option<BackendChannel>> {
            let size = real.size()?;
            let target = table.resolve(damped(size).max(estimate))?;
            let current = real.store().kind();
            if target == current {
                return Ok(None);
            }

            debug!(from = %current, to = %target, size, "migrating open channel");
            let mut fresh = factory.create(target)?;
            fresh.reset(size)?;
            let mut next = StoreChannel::new(fresh);

            let end = real.position();
            real.seek(0)?;
            if let Err(e) = copy_channel(real, &mut next) {
                // Leave the caller on the old backend at its old position.
                real.seek(end)?;
                return Err(e);
            }
            real.close()?;
            next.seek(end)?;

            migrations.fetch_add(1, Ordering::AcqRel);
            Ok(Some(next))
        },
    )
}

/// Channel over a [`Blob`], stable across live migrations.
pub struct DispatchChannel<'a> {
    slot: &'a mut Backend,
    inner: Option<ChannelWrapper<'static, BackendChannel>>,
}

impl DispatchChannel<'_> {
    /// Kind of the backend the channel is currently writing to.
    pub fn active_kind(&self) -> Option<BackendKind> {
        self.inner.as_ref().map(|w| w.base().store().kind())
    }

    fn live(&mut self) -> Result<&mut ChannelWrapper<'static, BackendChannel>> {
        self.inner.as_mut().ok_or(Error::ChannelClosed)
    }

    fn restore(&mut self, inner: ChannelWrapper<'static, BackendChannel>) {
        *self.slot = inner.into_base().into_inner();
    }
}

impl BlobChannel for DispatchChannel<'_> {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.live()?.read(dst)
    }

    fn write(&mut self, src: &[u8]) -> Result<usize> {
        self.live()?.write(src)
    }

    fn position(&self) -> u64 {
        self.inner.as_ref().map_or(0, |w| w.position())
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.live()?.seek(position)
    }

    fn size(&self) -> Result<u64> {
        match &self.inner {
            Some(w) => w.size(),
            None => Ok(self.slot.length()),
        }
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.live()?.truncate(size)
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn close(&mut self) -> Result<()> {
        match self.inner.take() {
            Some(mut inner) => {
                let closed = inner.close();
                self.restore(inner);
                closed
            }
            None => Ok(()),
        }
    }
}

impl Drop for DispatchChannel<'_> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            self.restore(inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use blobstore_core::ThresholdEntry;
    use blobstore_mem::Reclaimer;

    use super::*;

    fn factory(entries: &[(BackendKind, u64)]) -> (Arc<BackendFactory>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = PayloadConfig {
            containers: entries
                .iter()
                .map(|(k, m)| ThresholdEntry::new(*k, *m))
                .collect(),
            ..PayloadConfig::default()
        };
        let factory = BackendFactory::new(config)
            .unwrap()
            .with_temp_dir(dir.path())
            .with_reclaimers(Reclaimer::new("native-test"), Reclaimer::new("disk-test"));
        (Arc::new(factory), dir)
    }

    #[test]
    fn damping_is_eighty_percent() {
        assert_eq!(damped(0), 0);
        assert_eq!(damped(10), 8);
        assert_eq!(damped(13), 10);
        assert_eq!(damped(14), 11);
        assert_eq!(damped(u64::MAX), u64::MAX / 5 * 4);
    }

    #[test]
    fn starts_on_the_zero_size_backend() {
        let (f, _dir) = factory(&[(BackendKind::Native, 4), (BackendKind::Disk, u64::MAX)]);
        let blob = Blob::new(f).unwrap();
        assert_eq!(blob.active_kind(), BackendKind::Native);
    }

    #[test]
    fn set_data_picks_backend_by_size() {
        let (f, _dir) = factory(&[(BackendKind::Heap, 4), (BackendKind::Disk, u64::MAX)]);
        let mut blob = Blob::new(f).unwrap();
        blob.set_data(Some(b"abc".to_vec())).unwrap();
        assert_eq!(blob.active_kind(), BackendKind::Heap);
        blob.set_data(Some(b"abcdef".to_vec())).unwrap();
        assert_eq!(blob.active_kind(), BackendKind::Disk);
        assert_eq!(&*blob.data().unwrap(), b"abcdef");
        blob.set_data(None).unwrap();
        assert_eq!(blob.active_kind(), BackendKind::Heap);
        assert_eq!(blob.length(), 0);
    }

    #[test]
    fn set_data_range_switches_on_slice_length() {
        let (f, _dir) = factory(&[(BackendKind::Heap, 4), (BackendKind::Native, u64::MAX)]);
        let mut blob = Blob::new(f).unwrap();
        blob.set_data_range(Some(b"abcdefghijk"), 3, 4).unwrap();
        assert_eq!(blob.active_kind(), BackendKind::Heap);
        assert_eq!(&*blob.data().unwrap(), b"defg");
    }

    #[test]
    fn migration_keeps_content_position_and_handle() {
        let (f, _dir) = factory(&[(BackendKind::Heap, 10), (BackendKind::Disk, u64::MAX)]);
        let mut blob = Blob::new(f).unwrap();
        {
            let mut ch = blob.new_channel(0).unwrap();
            ch.write_all(b"01234").unwrap();
            ch.seek(0).unwrap();
            let mut back = [0u8; 5];
            assert_eq!(ch.read(&mut back).unwrap(), 5);
            assert_eq!(&back, b"01234");
            ch.write_all(b"56789abcde").unwrap();
            assert_eq!(ch.position(), 15);
            ch.close().unwrap();
        }
        assert_eq!(blob.active_kind(), BackendKind::Disk);
        assert_eq!(blob.migrations(), 1);
        assert_eq!(&*blob.data().unwrap(), b"0123456789abcde");
    }

    #[test]
    fn dropping_an_open_channel_restores_the_backend() {
        let (f, _dir) = factory(&[(BackendKind::Heap, 4), (BackendKind::Native, u64::MAX)]);
        let mut blob = Blob::new(f).unwrap();
        let mut ch = blob.channel().unwrap();
        ch.write_all(b"0123456789").unwrap();
        drop(ch);
        assert_eq!(blob.active_kind(), BackendKind::Native);
        assert_eq!(&*blob.data().unwrap(), b"0123456789");
    }

    #[test]
    fn closed_dispatch_channel_rejects_io() {
        let (f, _dir) = factory(&[(BackendKind::Heap, u64::MAX)]);
        let mut blob = Blob::new(f).unwrap();
        let mut ch = blob.new_channel(0).unwrap();
        ch.write_all(b"x").unwrap();
        ch.close().unwrap();
        assert!(!ch.is_open());
        assert!(matches!(ch.write(b"y"), Err(Error::ChannelClosed)));
        assert_eq!(ch.size().unwrap(), 1);
        assert!(ch.close().is_ok());
    }

    #[test]
    fn ceilings_are_checked_before_delegating() {
        let (f, _dir) = factory(&[(BackendKind::Heap, u64::MAX)]);
        let mut config = f.config().clone();
        config.max_array_length = 100;
        let f = Arc::new(BackendFactory::new(config).unwrap());
        let mut blob = Blob::new(f).unwrap();
        blob.set_data(Some(vec![0u8; 101])).unwrap();
        assert!(matches!(
            blob.data(),
            Err(Error::MaterializationTooLarge { size: 101, max: 100 })
        ));
        blob.set_data(Some(vec![0u8; 100])).unwrap();
        assert_eq!(blob.data().unwrap().len(), 100);
    }

    #[test]
    fn beyond_the_table_is_a_config_fault() {
        let (f, _dir) = factory(&[(BackendKind::Heap, 4)]);
        let mut blob = Blob::new(f).unwrap();
        let err = blob.set_data(Some(vec![1u8; 5])).unwrap_err();
        assert!(matches!(err, Error::NoBackendForSize { size: 5, .. }));
        assert!(blob.data().unwrap().is_empty());
    }

    #[test]
    fn clone_is_independent_and_same_kind() {
        let (f, _dir) = factory(&[(BackendKind::Native, 4), (BackendKind::Disk, u64::MAX)]);
        let mut blob = Blob::with_data(f, b"0123456".to_vec()).unwrap();
        let mut copy = blob.try_clone().unwrap();
        blob.set_data(Some(b"x".to_vec())).unwrap();
        assert_eq!(copy.kind(), BackendKind::Disk);
        assert_eq!(&*copy.data().unwrap(), b"0123456");
    }
}
