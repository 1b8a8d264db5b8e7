use crate::{Result, StorageApi};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    // Stored value plus optional expiration.
    value: Bytes,
    expires_at: Option<Instant>,
    seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    fn order(&self) -> ExpiryOrder {
        (self.expires_at.is_none(), self.expires_at, self.seq)
    }
}

// Soonest expiry first; entries without a TTL sort last, oldest first.
type ExpiryOrder = (bool, Option<Instant>, u64);

#[derive(Debug, Default)]
struct Store {
    entries: HashMap<String, CacheEntry>,
    by_expiry: BTreeMap<ExpiryOrder, String>,
    next_seq: u64,
}

impl Store {
    fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: &str, value: Bytes, expires_at: Option<Instant>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = CacheEntry {
            value,
            expires_at,
            seq,
        };
        self.by_expiry.insert(entry.order(), key.to_string());
        if let Some(previous) = self.entries.insert(key.to_string(), entry) {
            self.by_expiry.remove(&previous.order());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.by_expiry.remove(&entry.order());
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((order, key)) = self.by_expiry.first_key_value() {
            if !order.1.is_some_and(|expires_at| now >= expires_at) {
                break;
            }
            let key = key.clone();
            self.remove(&key);
            removed += 1;
        }
        removed
    }

    // Evict the entry closest to expiry, never `keep`.
    fn evict_one(&mut self, keep: &str) -> bool {
        let Some(victim) = self
            .by_expiry
            .values()
            .find(|key| key.as_str() != keep)
            .cloned()
        else {
            return false;
        };
        self.remove(&victim).is_some()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Simple in-memory cache with optional TTL expiry.
///
/// ```
/// use bytes::Bytes;
/// use relaymux_storage::{EphemeralCache, StorageApi};
///
/// let cache = EphemeralCache::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     cache.set("k", Bytes::from_static(b"v"), None).await.expect("set");
///     assert_eq!(cache.get("k").await.expect("get"), Some(Bytes::from_static(b"v")));
/// });
/// ```
#[derive(Debug)]
pub struct EphemeralCache {
    // RwLock allows concurrent readers while updates take exclusive access.
    inner: RwLock<Store>,
    // Optional size cap; entries closest to expiry are evicted first.
    max_entries: Option<usize>,
}

impl EphemeralCache {
    // Use Default to centralize initialization.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            inner: RwLock::new(Store::default()),
            max_entries: Some(max_entries),
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.inner.write().await.purge_expired(now)
    }

    /// Periodically purge expired entries. Write-once keys (dedup records)
    /// are never read again, so lazy expiry alone would retain them.
    ///
    /// The task holds only a weak reference and exits once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.purge_expired().await;
                if removed > 0 {
                    tracing::debug!(removed, "cache sweep");
                }
            }
        })
    }

    fn insert_locked(
        &self,
        store: &mut Store,
        key: &str,
        value: Bytes,
        expires_at: Option<Instant>,
    ) {
        store.insert(key, value, expires_at);
        if let Some(max_entries) = self.max_entries {
            while store.len() > max_entries && store.evict_one(key) {}
        }
    }
}

#[async_trait]
impl StorageApi for EphemeralCache {
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        // Compute expiry once so reads only compare Instants.
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut guard = self.inner.write().await;
        self.insert_locked(&mut guard, key, value, expires_at);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        // Take a write lock so we can evict expired entries.
        let mut guard = self.inner.write().await;
        if let Some(entry) = guard.get(key) {
            if entry.is_expired(Instant::now()) {
                guard.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<Option<Bytes>> {
        let now = Instant::now();
        let removed = self.inner.write().await.remove(key);
        Ok(removed
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value))
    }

    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool> {
        // Check and insert under one write lock so concurrent callers race safely.
        let now = Instant::now();
        let mut guard = self.inner.write().await;
        if guard.get(key).is_some_and(|entry| !entry.is_expired(now)) {
            return Ok(false);
        }
        let expires_at = ttl.map(|ttl| now + ttl);
        self.insert_locked(&mut guard, key, value, expires_at);
        Ok(true)
    }

    async fn len(&self) -> Result<usize> {
        // Only a read lock is needed for length.
        Ok(self.inner.read().await.len())
    }
}

impl Default for EphemeralCache {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Store::default()),
            max_entries: None,
        }
    }
}
