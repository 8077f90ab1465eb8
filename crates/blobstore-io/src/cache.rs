//! Best-effort content cache for the disk backend.
//!
//! Entries are whole-file snapshots keyed by backend id and bounded by total
//! bytes. The cache is purely an accelerator: a miss always falls back to the
//! file, and every mutation path invalidates the entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Debug)]
struct Entries {
    lru: LruCache<u64, Arc<[u8]>>,
    bytes: u64,
}

#[derive(Debug)]
pub struct DiskCache {
    entries: Mutex<Entries>,
    capacity_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DiskCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(Entries {
                lru: LruCache::unbounded(),
                bytes: 0,
            }),
            capacity_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn get(&self, id: u64) -> Option<Arc<[u8]>> {
        let hit = self.entries.lock().lru.get(&id).cloned();
        match hit {
            Some(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(bytes)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Cache `bytes` for `id`, evicting least recently used entries to stay
    /// within capacity. Snapshots larger than the whole cache are skipped.
    pub fn insert(&self, id: u64, bytes: Arc<[u8]>) {
        let size = bytes.len() as u64;
        if size > self.capacity_bytes {
            return;
        }
        let mut entries = self.entries.lock();
        if let Some(old) = entries.lru.put(id, bytes) {
            entries.bytes -= old.len() as u64;
        }
        entries.bytes += size;
        while entries.bytes > self.capacity_bytes {
            match entries.lru.pop_lru() {
                Some((evicted, old)) => {
                    entries.bytes -= old.len() as u64;
                    trace!(id = evicted, bytes = old.len(), "disk cache eviction");
                }
                None => break,
            }
        }
    }

    pub fn invalidate(&self, id: u64) {
        let mut entries = self.entries.lock();
        if let Some(old) = entries.lru.pop(&id) {
            entries.bytes -= old.len() as u64;
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.lock().lru.contains(&id)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: entries.lru.len(),
            bytes: entries.bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(n: usize) -> Arc<[u8]> {
        Arc::from(vec![7u8; n])
    }

    #[test]
    fn hit_after_insert_and_miss_after_invalidate() {
        let cache = DiskCache::new(100);
        cache.insert(1, bytes(10));
        assert_eq!(cache.get(1).map(|b| b.len()), Some(10));
        cache.invalidate(1);
        assert!(cache.get(1).is_none());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.bytes), (1, 1, 0));
    }

    #[test]
    fn evicts_least_recently_used_by_bytes() {
        let cache = DiskCache::new(25);
        cache.insert(1, bytes(10));
        cache.insert(2, bytes(10));
        let _ = cache.get(1);
        cache.insert(3, bytes(10));
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
        assert_eq!(cache.stats().bytes, 20);
    }

    #[test]
    fn oversized_snapshots_are_not_cached() {
        let cache = DiskCache::new(5);
        cache.insert(1, bytes(6));
        assert!(!cache.contains(1));
    }

    #[test]
    fn replacing_an_entry_keeps_accounting_straight() {
        let cache = DiskCache::new(100);
        cache.insert(1, bytes(40));
        cache.insert(1, bytes(10));
        assert_eq!(cache.stats().bytes, 10);
        assert_eq!(cache.stats().entries, 1);
    }
}
