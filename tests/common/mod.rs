//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use blobstore_core::{BackendKind, PayloadConfig, ThresholdEntry};
use blobstore_exec::{BackendFactory, Blob};
use blobstore_io::DiskFile;
use blobstore_mem::{NativeSlot, Reclaimer};
use tempfile::TempDir;

/// A factory whose temp files and reclaimers are private to one test.
pub struct Store {
    pub dir: TempDir,
    pub factory: Arc<BackendFactory>,
    pub native: Reclaimer<NativeSlot>,
    pub disk: Reclaimer<DiskFile>,
}

impl Store {
    pub fn new(entries: &[(BackendKind, u64)]) -> Self {
        Self::with_config(config(entries))
    }

    pub fn with_config(config: PayloadConfig) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let native = Reclaimer::new("native");
        let disk = Reclaimer::new("disk");
        let factory = BackendFactory::new(config)
            .expect("valid config")
            .with_temp_dir(dir.path())
            .with_reclaimers(native.clone(), disk.clone());
        Self {
            dir,
            factory: Arc::new(factory),
            native,
            disk,
        }
    }

    pub fn blob(&self) -> Blob {
        Blob::new(Arc::clone(&self.factory)).expect("blob")
    }

    pub fn temp_files(&self) -> usize {
        std::fs::read_dir(self.dir.path())
            .map(|d| d.count())
            .unwrap_or(0)
    }
}

pub fn config(entries: &[(BackendKind, u64)]) -> PayloadConfig {
    PayloadConfig {
        containers: entries
            .iter()
            .map(|(kind, max)| ThresholdEntry::new(*kind, *max))
            .collect(),
        ..PayloadConfig::default()
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub const ALL_KINDS: [BackendKind; 5] = [
    BackendKind::Heap,
    BackendKind::Chunked,
    BackendKind::Native,
    BackendKind::Disk,
    BackendKind::Legacy,
];
