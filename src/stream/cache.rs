use lru::LruCache;
use serde::Serialize;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Identifies one cached read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// A merged page. `feed_ids` is sorted and deduplicated.
    Stream {
        feed_ids: Vec<i64>,
        offset: i64,
        page_size: i64,
        viewer: Option<String>,
    },
    /// A single feed's newest entries
    FeedEntries { feed_id: i64, limit: i64 },
}

impl CacheKey {
    pub fn stream(feed_ids: &[i64], offset: i64, page_size: i64, viewer: Option<&str>) -> Self {
        let mut feed_ids = feed_ids.to_vec();
        feed_ids.sort_unstable();
        feed_ids.dedup();
        CacheKey::Stream {
            feed_ids,
            offset,
            page_size,
            viewer: viewer.map(str::to_string),
        }
    }

    fn touches(&self, ids: &[i64]) -> bool {
        match self {
            CacheKey::Stream { feed_ids, .. } => feed_ids.iter().any(|id| ids.contains(id)),
            CacheKey::FeedEntries { feed_id, .. } => ids.contains(feed_id),
        }
    }
}

/// Values that may opt out of caching (e.g. degraded pages).
pub trait Cacheable: Clone {
    fn is_cacheable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct Slot<V> {
    value: V,
    expires_at: Instant,
}

/// Bounded LRU cache with per-entry TTL in front of the read paths.
///
/// Purely advisory: a restart empties it and every miss recomputes from the
/// store. The lock is never held across the compute future, so two callers
/// missing on the same key may both compute; the later insert wins.
///
/// Any invalidation bumps a generation counter. A compute that started
/// before the bump returns its value to the caller but does not store it.
pub struct ResponseCache<V> {
    inner: Mutex<LruCache<CacheKey, Slot<V>>>,
    /// Only written while `inner` is locked
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Cacheable> ResponseCache<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached value for `key` if younger than its TTL, otherwise
    /// run `compute` and store the result (unless it declines caching).
    pub async fn get_or_compute<F, Fut>(&self, key: CacheKey, ttl: Duration, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        if let Some(value) = self.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return value;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let started = self.generation.load(Ordering::Acquire);
        let value = compute().await;
        if value.is_cacheable() && !ttl.is_zero() {
            let mut cache = self.lock();
            if self.generation.load(Ordering::Acquire) == started {
                let slot = Slot {
                    value: value.clone(),
                    expires_at: Instant::now() + ttl,
                };
                cache.put(key, slot);
            } else {
                tracing::debug!("Cache invalidated during compute, result not stored");
            }
        }
        value
    }

    fn get(&self, key: &CacheKey) -> Option<V> {
        let mut cache = self.lock();
        let expired = match cache.get(key) {
            Some(slot) if slot.expires_at > Instant::now() => return Some(slot.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
        }
        None
    }

    /// Drop every cached value that involves any of `feed_ids`.
    /// Returns the number of entries removed.
    pub fn invalidate_feeds(&self, feed_ids: &[i64]) -> usize {
        if feed_ids.is_empty() {
            return 0;
        }
        let mut cache = self.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let doomed: Vec<CacheKey> = cache
            .iter()
            .filter(|(key, _)| key.touches(feed_ids))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            cache.pop(key);
        }
        if !doomed.is_empty() {
            tracing::debug!(feeds = ?feed_ids, removed = doomed.len(), "Invalidated cached reads");
        }
        doomed.len()
    }

    pub fn invalidate_all(&self) {
        let mut cache = self.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        cache.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.lock().len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<CacheKey, Slot<V>>> {
        // Poisoning is ignored: the cache is advisory
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
