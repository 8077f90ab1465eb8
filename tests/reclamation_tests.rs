//! Exactly-once release of native memory and temp files.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use blobstore_core::{BackendKind, BlobChannel, BlobContainer, Error};
use blobstore_exec::{install_with, BackendFactory, Components, ThreadHost};
use blobstore_io::DiskBuffer;
use blobstore_mem::{CountingAllocator, Reclaimer, UsageMonitor};
use common::{config, pattern, Store};

fn counting_store(entries: &[(BackendKind, u64)]) -> (Store, Arc<CountingAllocator>) {
    let store = Store::new(entries);
    let allocator = Arc::new(CountingAllocator::new());
    let factory = BackendFactory::new(config(entries))
        .unwrap()
        .with_temp_dir(store.dir.path())
        .with_native_allocator(allocator.clone())
        .with_reclaimers(store.native.clone(), store.disk.clone());
    let store = Store {
        factory: Arc::new(factory),
        ..store
    };
    (store, allocator)
}

fn eventually(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn test_dropped_native_freed_exactly_once() {
    let (store, allocator) = counting_store(&[(BackendKind::Native, u64::MAX)]);
    let mut blob = store.blob();
    {
        let mut ch = blob.new_channel(0).unwrap();
        // Several grows, each freeing the region it replaces.
        for chunk in pattern(5000).chunks(700) {
            ch.write_all(chunk).unwrap();
        }
        // Abandoned without close.
    }
    assert_eq!(allocator.live_allocations(), 1);
    assert!(allocator.stats().allocations > 1);
    drop(blob);

    assert_eq!(store.native.pending_count(), 0);
    assert_eq!(store.native.reap_ready(), 0);
    let stats = allocator.stats();
    assert_eq!(stats.allocations, stats.frees);
    assert_eq!(stats.invalid_frees, 0);
    assert_eq!(stats.live_bytes, 0);
    assert_eq!(allocator.live_allocations(), 0);

    // Nothing left for the sweep.
    assert_eq!(store.native.shutdown_sweep(), 0);
    assert_eq!(allocator.stats(), stats);
    assert_eq!(store.native.released_count(), 1);
}

#[test]
fn test_sweep_frees_live_native_and_fails_later_access() {
    let (store, allocator) = counting_store(&[(BackendKind::Native, u64::MAX)]);
    let mut blob = store.blob();
    blob.set_data(Some(pattern(256))).unwrap();

    assert_eq!(store.native.shutdown_sweep(), 1);
    assert_eq!(allocator.live_allocations(), 0);
    assert!(matches!(blob.data(), Err(Error::Released)));

    drop(blob);
    assert_eq!(store.native.pending_count(), 0);
    assert_eq!(allocator.stats().invalid_frees, 0);
    assert_eq!(store.native.released_count(), 1);
}

#[test]
fn test_migration_frees_superseded_native_region() {
    let (store, allocator) =
        counting_store(&[(BackendKind::Native, 100), (BackendKind::Heap, u64::MAX)]);
    let mut blob = store.blob();
    {
        let mut ch = blob.new_channel(0).unwrap();
        ch.write_all(&pattern(50)).unwrap();
        ch.write_all(&pattern(200)).unwrap();
        ch.close().unwrap();
    }
    assert_eq!(blob.active_kind(), BackendKind::Heap);
    assert_eq!(allocator.live_allocations(), 0);
    assert_eq!(allocator.stats().invalid_frees, 0);
}

#[test]
fn test_dropped_disk_file_deleted_once() {
    let store = Store::new(&[(BackendKind::Disk, u64::MAX)]);
    let mut blob = store.blob();
    blob.set_data(Some(pattern(1000))).unwrap();
    let path = blob
        .file_provider()
        .map(|p| p.path().to_path_buf())
        .unwrap();
    assert!(path.exists());
    drop(blob);

    assert!(!path.exists());
    assert_eq!(store.disk.reap_ready(), 0);
    assert_eq!(store.disk.shutdown_sweep(), 0);
    assert_eq!(store.disk.released_count(), 1);
    assert_eq!(store.temp_files(), 0);
}

#[test]
fn test_sweep_deletes_live_disk_file() {
    let store = Store::new(&[(BackendKind::Disk, u64::MAX)]);
    let mut blob = store.blob();
    blob.set_data(Some(b"pending".to_vec())).unwrap();
    assert_eq!(store.temp_files(), 1);

    assert_eq!(store.disk.shutdown_sweep(), 1);
    assert_eq!(store.temp_files(), 0);
    assert!(matches!(blob.data(), Err(Error::Released)));
}

#[test]
fn test_installed_host_reaps_and_sweeps() {
    let store = Store::new(&[(BackendKind::Heap, 8), (BackendKind::Disk, u64::MAX)]);
    let host = ThreadHost::new();
    let parts = Components {
        native: store.native.clone(),
        disk: store.disk.clone(),
        monitor: Box::leak(Box::new(UsageMonitor::new())),
    };
    let mut cfg = config(&[(BackendKind::Heap, u64::MAX)]);
    cfg.reaper_poll_millis = 10;
    install_with(&host, &cfg, parts).unwrap();

    let mut dropped = store.blob();
    dropped.set_data(Some(pattern(64))).unwrap();
    let mut kept = store.blob();
    kept.set_data(Some(pattern(64))).unwrap();
    assert_eq!(store.temp_files(), 2);

    drop(dropped);
    assert!(eventually(|| store.disk.released_count() == 1));
    assert_eq!(store.temp_files(), 1);

    host.shutdown();
    assert_eq!(store.disk.released_count(), 2);
    assert_eq!(store.temp_files(), 0);
    assert!(matches!(kept.data(), Err(Error::Released)));
}

#[test]
fn test_disk_backend_direct_construction_is_tracked() {
    let store = Store::new(&[(BackendKind::Disk, u64::MAX)]);
    let cache = store.factory.disk_cache().clone();
    let disk = DiskBuffer::create_in(store.dir.path(), true, cache, &store.disk).unwrap();
    assert_eq!(store.disk.pending_count(), 1);
    let mut boxed: Box<dyn BlobContainer> = Box::new(disk);
    boxed.set_data(Some(b"x".to_vec())).unwrap();
    drop(boxed);
    assert_eq!(store.disk.pending_count(), 0);
    assert_eq!(store.temp_files(), 0);
}

#[test]
fn test_many_dropped_blobs_release_without_any_reaper() {
    let (store, allocator) = counting_store(&[(BackendKind::Native, u64::MAX)]);
    for _ in 0..50 {
        let mut blob = store.blob();
        blob.set_data(Some(pattern(4096))).unwrap();
    }
    assert_eq!(store.native.pending_count(), 0);
    let stats = allocator.stats();
    assert_eq!(stats.live_bytes, 0);
    assert_eq!(stats.frees, stats.allocations);
    assert_eq!(stats.invalid_frees, 0);

    let store = Store::new(&[(BackendKind::Disk, u64::MAX)]);
    for _ in 0..50 {
        let mut blob = store.blob();
        blob.set_data(Some(pattern(4096))).unwrap();
    }
    assert_eq!(store.disk.pending_count(), 0);
    assert_eq!(store.disk.released_count(), 50);
    assert_eq!(store.temp_files(), 0);
}
