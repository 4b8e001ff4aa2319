use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru_time_cache::LruCache;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::response::DnsResponse;
use super::now_unix;

/// Hard ceiling on how long any response may stay cached.
pub const MAX_BACKEND_TTL: u32 = 3600;
const CACHE_CAPACITY: usize = 4096;

/// One cached upstream response together with its TTL bookkeeping.
#[derive(Clone)]
pub struct CacheEntry {
    pub response: Arc<DnsResponse>,
    /// Wall-clock seconds when the entry was stored.
    pub set_unix: i64,
    /// Seconds after `set_unix` at which the entry must no longer be served.
    pub backend_ttl: u32,
}

/// Backend contract shared by the in-process map and out-of-process stores.
/// A failing backend reports `None`/no-op; it never propagates errors into
/// the query path.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheEntry>;
    async fn set(&self, key: String, entry: CacheEntry, ttl: Duration);
    async fn remove(&self, key: &str);
}

/// In-process backend: LRU map with a cache-wide expiry at the backend TTL
/// ceiling. Entries with a shorter per-entry TTL are filtered lazily by
/// [`ResponseCache`] on read.
pub struct InternalCache {
    inner: RwLock<LruCache<String, CacheEntry>>,
}

impl InternalCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LruCache::with_expiry_duration_and_capacity(
                Duration::from_secs(MAX_BACKEND_TTL as u64),
                CACHE_CAPACITY,
            )),
        }
    }
}

impl Default for InternalCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InternalCache {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.inner.read().await.peek(key).cloned()
    }

    async fn set(&self, key: String, entry: CacheEntry, _ttl: Duration) {
        self.inner.write().await.insert(key, entry);
    }

    async fn remove(&self, key: &str) {
        self.inner.write().await.remove(key);
    }
}

/// Placeholder redis backend. Keeps the async contract so an out-of-process
/// store can be dropped in; until then every probe is a miss.
pub struct RedisCache {
    uri: String,
    warned: std::sync::Once,
}

impl RedisCache {
    pub fn new(uri: String) -> Self {
        Self {
            uri,
            warned: std::sync::Once::new(),
        }
    }

    fn warn_stub(&self) {
        self.warned.call_once(|| {
            warn!(
                "redis cache backend at {} is not implemented, all lookups miss",
                self.uri
            );
        });
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, _key: &str) -> Option<CacheEntry> {
        self.warn_stub();
        None
    }

    async fn set(&self, _key: String, _entry: CacheEntry, _ttl: Duration) {
        self.warn_stub();
    }

    async fn remove(&self, _key: &str) {}
}

/// Response cache with read-time TTL adjustment, shared by one resolver
/// instance.
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn internal() -> Self {
        Self::new(Arc::new(InternalCache::new()))
    }

    /// Cache probe. A hit yields a TTL-decremented view of the stored
    /// response. Entries past their backend TTL, or stored in the future
    /// (clock went backwards), are purged and reported as misses.
    pub async fn get(&self, key: &str) -> Option<DnsResponse> {
        let entry = self.store.get(key).await?;
        let now = now_unix();
        let elapsed = now - entry.set_unix;
        if elapsed < 0 || elapsed >= entry.backend_ttl as i64 {
            debug!("cache entry for {} expired (elapsed {}s)", key, elapsed);
            self.store.remove(key).await;
            return None;
        }
        Some(entry.response.ttl_reduced(elapsed as u32, now))
    }

    /// Stores a response. `backend_ttl` is clamped at [`MAX_BACKEND_TTL`].
    pub async fn set(&self, key: String, response: Arc<DnsResponse>, backend_ttl: u32) {
        let ttl = backend_ttl.min(MAX_BACKEND_TTL);
        let entry = CacheEntry {
            response,
            set_unix: now_unix(),
            backend_ttl: ttl,
        };
        self.store
            .set(key, entry, Duration::from_secs(ttl as u64))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::response::testutil::*;
    use super::*;

    async fn seeded(ttl: u32, backend_ttl: u32, age: i64) -> (ResponseCache, String) {
        let cache = ResponseCache::internal();
        let rsp = answer_response(vec![a_record(
            "example.com.",
            ttl,
            "1.2.3.4".parse().unwrap(),
        )]);
        let key = "NAME[example.com.]TYPE[1]".to_string();
        let entry = CacheEntry {
            response: Arc::new(rsp),
            set_unix: now_unix() - age,
            backend_ttl,
        };
        cache
            .store
            .set(key.clone(), entry, Duration::from_secs(backend_ttl as u64))
            .await;
        (cache, key)
    }

    #[tokio::test]
    async fn hit_decrements_remaining_ttl() {
        let (cache, key) = seeded(300, 300, 1).await;
        let view = cache.get(&key).await.expect("hit");
        let ttl = view.answer[0].ttl();
        assert!((298..=299).contains(&ttl), "decremented ttl was {}", ttl);
    }

    #[tokio::test]
    async fn entry_past_backend_ttl_is_a_miss() {
        let (cache, key) = seeded(7200, MAX_BACKEND_TTL, 3601).await;
        assert!(cache.get(&key).await.is_none());
        // and it was purged, not merely skipped
        assert!(cache.store.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn long_ttl_is_visible_until_backend_expiry() {
        let (cache, key) = seeded(7200, MAX_BACKEND_TTL, 3500).await;
        let view = cache.get(&key).await.expect("hit");
        let ttl = view.answer[0].ttl();
        assert!((3699..=3700).contains(&ttl), "remaining ttl was {}", ttl);
    }

    #[tokio::test]
    async fn backward_clock_purges_entry() {
        let (cache, key) = seeded(300, 300, -5).await;
        assert!(cache.get(&key).await.is_none());
        assert!(cache.store.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn set_clamps_backend_ttl() {
        let cache = ResponseCache::internal();
        let rsp = answer_response(vec![a_record(
            "example.com.",
            7200,
            "1.2.3.4".parse().unwrap(),
        )]);
        cache
            .set("k".to_string(), Arc::new(rsp), 7200)
            .await;
        let entry = cache.store.get("k").await.expect("stored");
        assert_eq!(entry.backend_ttl, MAX_BACKEND_TTL);
    }

    #[tokio::test]
    async fn redis_stub_always_misses() {
        let cache = ResponseCache::new(Arc::new(RedisCache::new(
            "redis://127.0.0.1:6379".into(),
        )));
        let rsp = answer_response(Vec::new());
        cache.set("k".to_string(), Arc::new(rsp), 60).await;
        assert!(cache.get("k").await.is_none());
    }
}
