//! Best-effort disk cache: never stale after a write or raw file access.

mod common;

use std::fs::OpenOptions;
use std::io::Write;

use blobstore_core::{BackendKind, BlobChannel, BlobContainer};
use blobstore_io::DiskBuffer;
use common::{config, pattern, Store};

fn disk_store(keep_cache: bool) -> Store {
    let mut cfg = config(&[(BackendKind::Disk, u64::MAX)]);
    cfg.disk.keep_cache = keep_cache;
    Store::with_config(cfg)
}

fn disk(store: &Store) -> DiskBuffer {
    DiskBuffer::create_in(
        store.dir.path(),
        true,
        store.factory.disk_cache().clone(),
        &store.disk,
    )
    .unwrap()
}

#[test]
fn test_repeated_data_hits_cache() {
    let store = disk_store(true);
    let mut backend = disk(&store);
    backend.set_data(Some(pattern(512))).unwrap();
    assert!(!backend.is_cached());

    let first = backend.data().unwrap().into_vec();
    assert!(backend.is_cached());
    let second = backend.data().unwrap().into_vec();
    assert_eq!(first, second);
    assert!(store.factory.disk_cache().stats().hits >= 1);
}

#[test]
fn test_channel_write_invalidates_cache() {
    let store = disk_store(true);
    let mut backend = disk(&store);
    backend.set_data(Some(b"aaaa".to_vec())).unwrap();
    assert_eq!(&*backend.data().unwrap(), b"aaaa");
    assert!(backend.is_cached());
    {
        let mut ch = backend.channel().unwrap();
        ch.write_all(b"bb").unwrap();
        ch.close().unwrap();
    }
    assert!(!backend.is_cached());
    assert_eq!(&*backend.data().unwrap(), b"bbaa");
}

#[test]
fn test_dispatcher_write_invalidates_cache() {
    let store = disk_store(true);
    let mut blob = store.blob();
    blob.set_data(Some(b"12345".to_vec())).unwrap();
    assert_eq!(&*blob.data().unwrap(), b"12345");
    {
        let mut ch = blob.channel().unwrap();
        ch.seek(5).unwrap();
        ch.write_all(b"678").unwrap();
        ch.truncate(7).unwrap();
        ch.close().unwrap();
    }
    assert_eq!(&*blob.data().unwrap(), b"1234567");
}

#[test]
fn test_raw_file_access_invalidates_cache() {
    let store = disk_store(true);
    let mut backend = disk(&store);
    backend.set_data(Some(b"cached".to_vec())).unwrap();
    assert_eq!(&*backend.data().unwrap(), b"cached");
    {
        let provider = backend.file_provider().unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(provider.path())
            .unwrap();
        file.write_all(b" and extended").unwrap();
        drop(file);
        provider.close().unwrap();
    }
    assert_eq!(backend.length(), 19);
    assert_eq!(&*backend.data().unwrap(), b"cached and extended");
}

#[test]
fn test_acquiring_file_drops_cache_even_without_edits() {
    let store = disk_store(true);
    let mut backend = disk(&store);
    backend.set_data(Some(b"abc".to_vec())).unwrap();
    backend.data().unwrap();
    assert!(backend.is_cached());
    drop(backend.file_provider().unwrap());
    assert!(!backend.is_cached());
}

#[test]
fn test_cache_disabled_reads_file_each_time() {
    let store = disk_store(false);
    let mut blob = store.blob();
    blob.set_data(Some(pattern(100))).unwrap();
    assert_eq!(&*blob.data().unwrap(), &pattern(100)[..]);
    assert_eq!(store.factory.disk_cache().stats().entries, 0);
}

#[test]
fn test_new_channel_recreates_backing_file() {
    let store = disk_store(true);
    let mut backend = disk(&store);
    backend.set_data(Some(pattern(4096))).unwrap();
    let path = backend.path().to_path_buf();
    {
        let mut ch = backend.new_channel(10).unwrap();
        ch.write_all(b"fresh").unwrap();
        ch.close().unwrap();
    }
    assert_eq!(backend.path(), path);
    assert_eq!(std::fs::read(&path).unwrap(), b"fresh");
    assert_eq!(&*backend.data().unwrap(), b"fresh");
}

#[test]
fn test_clone_gets_its_own_file() {
    let store = disk_store(true);
    let mut original = disk(&store);
    original.set_data(Some(b"shared?".to_vec())).unwrap();
    let mut copy = original.try_clone().unwrap();
    assert_eq!(store.temp_files(), 2);

    original.set_data(Some(b"no".to_vec())).unwrap();
    assert_eq!(&*copy.data().unwrap(), b"shared?");
}
