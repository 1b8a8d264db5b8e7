// Expiring key/value cache contract shared by the identifier-mapping table
// and duplicate-frame suppression. Backends are swappable behind StorageApi.
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

mod ephemeral_cache;

pub use ephemeral_cache::EphemeralCache;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug)]
pub enum StorageError {
    Unsupported(&'static str),
    Unavailable(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Unsupported(feature) => write!(f, "unsupported: {feature}"),
            StorageError::Unavailable(reason) => write!(f, "cache unavailable: {reason}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Get/set/delete with per-key time-to-live.
///
/// Implementations own their internal consistency; callers never hold a lock
/// across these calls. `get` must never return an expired entry.
#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn delete(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store `value` only if no live entry exists. Returns true when stored.
    ///
    /// The default is a get-then-set and is not atomic; backends that can
    /// do better should override it.
    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool> {
        if self.get(key).await?.is_some() {
            return Ok(false);
        }
        self.set(key, value, ttl).await?;
        Ok(true)
    }

    /// Number of stored entries, expired-but-unswept ones included.
    async fn len(&self) -> Result<usize>;
}

/// Resolve the configured backend. Only the in-process store ships today.
///
/// With `sweep_every` set, a background task purges expired entries on that
/// interval for as long as the returned cache is alive.
pub fn from_endpoint(
    endpoint: Option<&str>,
    max_entries: Option<usize>,
    sweep_every: Option<Duration>,
) -> Result<Arc<dyn StorageApi>> {
    if endpoint.is_some() {
        return Err(StorageError::Unsupported("external cache endpoint"));
    }
    let cache = Arc::new(match max_entries {
        Some(max_entries) => EphemeralCache::with_capacity(max_entries),
        None => EphemeralCache::new(),
    });
    if let Some(every) = sweep_every {
        cache.spawn_sweeper(every);
    }
    Ok(cache)
}
