//! Byte-level blob cache in front of the fetcher.
//!
//! Keyed by URL and weighted by payload size, backed by `moka`'s
//! lock-free cache so both fetch workers and tests can hit it without
//! contention. A hit skips the network entirely; entries expire with the
//! reply's `expires` hint, falling back to a default time-to-live.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use moka::sync::Cache;

/// Default entry lifetime when the origin sends no expiry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Clone)]
struct BlobEntry {
    content: Bytes,
    expires: Instant,
}

/// Statistics of a blob cache.
#[derive(Debug, Default)]
pub struct BlobCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

/// URL-keyed byte cache with size-based eviction.
pub struct BlobCache {
    cache: Cache<String, BlobEntry>,
    stats: BlobCacheStats,
}

impl BlobCache {
    /// Creates a cache bounded to `max_size_bytes`.
    pub fn new(max_size_bytes: u64) -> Self {
        let cache = Cache::builder()
            .weigher(|key: &String, entry: &BlobEntry| {
                (key.len() + entry.content.len()).min(u32::MAX as usize) as u32
            })
            .max_capacity(max_size_bytes)
            .build();
        Self {
            cache,
            stats: BlobCacheStats::default(),
        }
    }

    /// Returns the cached bytes when present and not expired.
    pub fn get(&self, url: &str) -> Option<Bytes> {
        match self.cache.get(url) {
            Some(entry) if entry.expires > Instant::now() => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.content)
            }
            Some(_) => {
                self.cache.invalidate(url);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a reply body; `expires` falls back to [`DEFAULT_TTL`].
    pub fn put(&self, url: &str, content: Bytes, expires: Option<Instant>) {
        let expires = expires.unwrap_or_else(|| Instant::now() + DEFAULT_TTL);
        self.cache.insert(url.to_string(), BlobEntry { content, expires });
    }

    pub fn hits(&self) -> u64 {
        self.stats.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.stats.misses.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCache")
            .field("entries", &self.cache.entry_count())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}
