//! Read-through buffer for exporting archives
//!
//! Exporting walks every entry of a frozen archive, and lazily encoded
//! entries are compressed each time they are read. The cache keeps the
//! encoded bytes of small entries in a bounded LRU so repeated exports (or
//! several archives sharing sources) compress them once. Large entries are
//! only kept while a caller explicitly retains them.
//!
//! The cache is not thread-safe; use one per export pass.

use bytes::Bytes;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use tracing::trace;

/// Identity of a cached entry: data file index and offset
pub type EntryKey = (usize, u64);

/// Bounded small-entry LRU plus an explicit large-entry buffer
#[derive(Debug)]
pub struct ExportCache {
    small: LruCache<EntryKey, Bytes>,
    large: HashMap<EntryKey, Bytes>,
    small_entry_limit: usize,
    hits: u64,
    misses: u64,
}

impl ExportCache {
    /// Cache holding up to `capacity` entries smaller than `small_entry_limit`
    pub fn new(capacity: usize, small_entry_limit: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            small: LruCache::new(capacity),
            large: HashMap::new(),
            small_entry_limit,
            hits: 0,
            misses: 0,
        }
    }

    /// Cached bytes of an entry
    pub fn get(&mut self, key: EntryKey) -> Option<Bytes> {
        let found = self
            .large
            .get(&key)
            .cloned()
            .or_else(|| self.small.get(&key).cloned());
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    /// Offer an entry to the LRU; entries at or over the limit are ignored
    ///
    /// Returns whether the entry was stored.
    pub fn insert(&mut self, key: EntryKey, bytes: Bytes) -> bool {
        if bytes.len() >= self.small_entry_limit {
            return false;
        }
        if let Some((evicted, _)) = self.small.push(key, bytes)
            && evicted != key
        {
            trace!("Export cache evicted entry {evicted:?}");
        }
        true
    }

    /// Keep a large entry until [`release_large`](Self::release_large)
    pub fn retain_large(&mut self, key: EntryKey, bytes: Bytes) {
        self.large.insert(key, bytes);
    }

    /// Drop a retained large entry
    pub fn release_large(&mut self, key: EntryKey) -> Option<Bytes> {
        self.large.remove(&key)
    }

    /// Size limit for the LRU
    pub const fn small_entry_limit(&self) -> usize {
        self.small_entry_limit
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.small.len() + self.large.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by both buffers
    pub fn cached_bytes(&self) -> usize {
        self.small.iter().map(|(_, b)| b.len()).sum::<usize>()
            + self.large.values().map(Bytes::len).sum::<usize>()
    }

    /// `(hits, misses)` since creation
    pub const fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.small.clear();
        self.large.clear();
    }
}

impl Default for ExportCache {
    fn default() -> Self {
        Self::new(1024, 64 * 1024)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_small_entries_are_bounded() {
        let mut cache = ExportCache::new(2, 100);
        assert!(cache.insert((0, 0), Bytes::from_static(b"a")));
        assert!(cache.insert((0, 128), Bytes::from_static(b"b")));
        assert!(cache.insert((0, 256), Bytes::from_static(b"c")));
        assert_eq!(cache.len(), 2);
        assert!(cache.get((0, 0)).is_none());
        assert_eq!(cache.get((0, 256)).unwrap(), Bytes::from_static(b"c"));
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn test_large_entries_need_explicit_retention() {
        let mut cache = ExportCache::new(4, 4);
        let big = Bytes::from(vec![1u8; 10]);
        assert!(!cache.insert((1, 0), big.clone()));
        assert!(cache.get((1, 0)).is_none());

        cache.retain_large((1, 0), big.clone());
        assert_eq!(cache.get((1, 0)).unwrap(), big);
        assert_eq!(cache.cached_bytes(), 10);
        assert_eq!(cache.release_large((1, 0)).unwrap(), big);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut cache = ExportCache::new(0, 100);
        assert!(cache.insert((0, 0), Bytes::from_static(b"x")));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
