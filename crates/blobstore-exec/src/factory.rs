//! One constructor per backend kind.
//!
//! The threshold table names kinds; the factory turns a kind into a fresh,
//! empty backend wired to the right allocator, cache, temp directory and
//! reclaimer.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use blobstore_core::{BackendKind, BlobContainer, PayloadConfig, Result, ThresholdTable};
use blobstore_io::disk::{self, DiskFile};
use blobstore_io::{DiskBuffer, DiskCache};
use blobstore_mem::native::{self, NativeSlot};
use blobstore_mem::{
    ChunkedBuffer, HeapBuffer, LegacyAdapter, NativeAllocator, NativeBuffer, Reclaimer,
    SystemAllocator, DEFAULT_CHUNK_SIZE,
};

pub struct BackendFactory {
    config: PayloadConfig,
    table: Arc<ThresholdTable>,
    temp_dir: PathBuf,
    disk_cache: Arc<DiskCache>,
    chunk_size: usize,
    native_allocator: Arc<dyn NativeAllocator>,
    native_reclaimer: Reclaimer<NativeSlot>,
    disk_reclaimer: Reclaimer<DiskFile>,
}

impl BackendFactory {
    /// Build from configuration. An empty or unresolvable threshold table is
    /// rejected here, before any dispatcher exists.
    pub fn new(config: PayloadConfig) -> Result<Self> {
        let table = Arc::new(config.threshold_table()?);
        let temp_dir = config.disk.resolved_temp_dir()?;
        let disk_cache = Arc::new(DiskCache::new(config.disk.cache_capacity_bytes));
        debug!(%table, temp_dir = %temp_dir.display(), "backend factory ready");
        Ok(Self {
            config,
            table,
            temp_dir,
            disk_cache,
            chunk_size: DEFAULT_CHUNK_SIZE,
            native_allocator: Arc::new(SystemAllocator),
            native_reclaimer: native::reclaimer().clone(),
            disk_reclaimer: disk::reclaimer().clone(),
        })
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_native_allocator(mut self, allocator: Arc<dyn NativeAllocator>) -> Self {
        self.native_allocator = allocator;
        self
    }

    pub fn with_reclaimers(
        mut self,
        native: Reclaimer<NativeSlot>,
        disk: Reclaimer<DiskFile>,
    ) -> Self {
        self.native_reclaimer = native;
        self.disk_reclaimer = disk;
        self
    }

    pub fn config(&self) -> &PayloadConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<ThresholdTable> {
        &self.table
    }

    pub fn disk_cache(&self) -> &Arc<DiskCache> {
        &self.disk_cache
    }

    /// A fresh, empty backend of `kind`.
    pub fn create(&self, kind: BackendKind) -> Result<Box<dyn BlobContainer>> {
        Ok(match kind {
            BackendKind::Heap => Box::new(HeapBuffer::new()),
            BackendKind::Chunked => Box::new(
                ChunkedBuffer::with_chunk_size(self.chunk_size)
                    .with_materialize_limit(self.config.max_array_length),
            ),
            BackendKind::Native => Box::new(NativeBuffer::with_parts(
                Arc::clone(&self.native_allocator),
                &self.native_reclaimer,
            )),
            BackendKind::Disk => Box::new(DiskBuffer::create_in(
                &self.temp_dir,
                self.config.disk.keep_cache,
                Arc::clone(&self.disk_cache),
                &self.disk_reclaimer,
            )?),
            BackendKind::Legacy => Box::new(LegacyAdapter::new(Vec::new())),
        })
    }
}

impl fmt::Debug for BackendFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendFactory")
            .field("table", &self.table)
            .field("temp_dir", &self.temp_dir)
            .field("chunk_size", &self.chunk_size)
            .field("native_allocator", &self.native_allocator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use blobstore_core::{Error, ThresholdEntry};

    use super::*;

    #[test]
    fn creates_every_kind_empty() {
        let dir = tempfile::tempdir().unwrap();
        let factory = BackendFactory::new(PayloadConfig::default())
            .unwrap()
            .with_temp_dir(dir.path())
            .with_reclaimers(Reclaimer::new("n"), Reclaimer::new("d"));
        for kind in [
            BackendKind::Heap,
            BackendKind::Chunked,
            BackendKind::Native,
            BackendKind::Disk,
            BackendKind::Legacy,
        ] {
            let backend = factory.create(kind).unwrap();
            assert_eq!(backend.kind(), kind);
            assert_eq!(backend.length(), 0);
        }
    }

    #[test]
    fn empty_table_is_fatal_at_construction() {
        let config = PayloadConfig {
            containers: Vec::new(),
            ..PayloadConfig::default()
        };
        assert!(matches!(
            BackendFactory::new(config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn table_comes_from_config() {
        let config = PayloadConfig {
            containers: vec![
                ThresholdEntry::new(BackendKind::Heap, 10),
                ThresholdEntry::new(BackendKind::Disk, u64::MAX),
            ],
            ..PayloadConfig::default()
        };
        let factory = BackendFactory::new(config).unwrap();
        assert_eq!(factory.table().resolve(10).unwrap(), BackendKind::Heap);
        assert_eq!(factory.table().resolve(11).unwrap(), BackendKind::Disk);
    }
}
