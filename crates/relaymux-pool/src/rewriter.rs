// Subscription identifier rewriting.
// Client-local ids are made collision-free upstream by appending the owning
// client's id. Some relays reject ids above 63 characters, so the local part
// is truncated from the right while the suffix is always kept intact.
use bytes::Bytes;
use relaymux_storage::{StorageApi, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{PoolError, Result};

pub const SEPARATOR: char = ':';
pub const MAX_SUBSCRIPTION_ID_LEN: usize = 63;

const SUBSCRIPTION_KEY_PREFIX: &str = "sub:";
const PUBLISH_KEY_PREFIX: &str = "clientId:";

/// Identifier of one downstream connection. Never contains [`SEPARATOR`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        debug_assert!(!value.is_empty() && !value.contains(SEPARATOR));
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upstream-facing id for `local` owned by `client`.
pub fn to_global(local: &str, client: &ClientId) -> String {
    let suffix_len = 1 + client.as_str().chars().count();
    let budget = MAX_SUBSCRIPTION_ID_LEN.saturating_sub(suffix_len);
    let mut global: String = local.chars().take(budget).collect();
    global.push(SEPARATOR);
    global.push_str(client.as_str());
    global
}

/// Client id embedded in a global id. Splits on the last separator, so local
/// ids that contain the separator themselves are fine.
pub fn client_of(global: &str) -> Option<&str> {
    global
        .rsplit_once(SEPARATOR)
        .map(|(_, client)| client)
        .filter(|client| !client.is_empty())
}

/// Aggregation key for a pending publish. Keyed per client so two clients
/// publishing the same event never cancel each other's tracker.
pub fn publish_key(event_id: &str, client: &ClientId) -> String {
    format!("{event_id}{SEPARATOR}{client}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionMapping {
    pub local_id: String,
    pub client_id: ClientId,
    pub created_at_ms: u64,
}

/// Forward and reverse id mapping backed by the shared expiring cache.
#[derive(Clone)]
pub struct Rewriter {
    cache: Arc<dyn StorageApi>,
    ttl: Duration,
    // Serializes read-modify-write of publisher sets.
    publishers: Arc<Mutex<()>>,
}

impl Rewriter {
    pub fn new(cache: Arc<dyn StorageApi>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            publishers: Arc::new(Mutex::new(())),
        }
    }

    /// Record global -> (local, client) and return the global id.
    pub async fn bind_subscription(&self, local: &str, client: &ClientId) -> Result<String> {
        let global = to_global(local, client);
        let mapping = SubscriptionMapping {
            local_id: local.to_string(),
            client_id: client.clone(),
            created_at_ms: now_ms(),
        };
        let value = serde_json::to_vec(&mapping).map_err(|err| {
            PoolError::CacheUnavailable(StorageError::Unavailable(format!(
                "encode mapping: {err}"
            )))
        })?;
        self.cache
            .set(&subscription_key(&global), Bytes::from(value), Some(self.ttl))
            .await?;
        Ok(global)
    }

    pub async fn resolve_subscription(&self, global: &str) -> Result<SubscriptionMapping> {
        let unknown = || PoolError::UnknownSubscription(global.to_string());
        let embedded = client_of(global).ok_or_else(unknown)?;
        let raw = self
            .cache
            .get(&subscription_key(global))
            .await?
            .ok_or_else(unknown)?;
        let mapping: SubscriptionMapping = serde_json::from_slice(&raw).map_err(|err| {
            PoolError::CacheUnavailable(StorageError::Unavailable(format!(
                "corrupt mapping for {global}: {err}"
            )))
        })?;
        if mapping.client_id.as_str() != embedded {
            return Err(unknown());
        }
        Ok(mapping)
    }

    pub async fn forget_subscription(&self, global: &str) -> Result<()> {
        self.cache.delete(&subscription_key(global)).await?;
        Ok(())
    }

    /// Add `client` to the pending publishers of `event_id` so relay
    /// acknowledgements can be routed back to it.
    pub async fn bind_publish(&self, event_id: &str, client: &ClientId) -> Result<()> {
        let _guard = self.publishers.lock().await;
        let mut publishers = self.load_publishers(event_id).await?;
        if !publishers.contains(client) {
            publishers.push(client.clone());
        }
        self.store_publishers(event_id, &publishers).await
    }

    /// Every client still waiting on acknowledgements for `event_id`.
    pub async fn resolve_publishers(&self, event_id: &str) -> Result<Vec<ClientId>> {
        let publishers = self.load_publishers(event_id).await?;
        if publishers.is_empty() {
            return Err(PoolError::UnknownSubscription(event_id.to_string()));
        }
        Ok(publishers)
    }

    /// Remove `client` from the publishers of `event_id`. Other publishers
    /// of the same event are left in place.
    pub async fn forget_publish(&self, event_id: &str, client: &ClientId) -> Result<()> {
        let _guard = self.publishers.lock().await;
        let mut publishers = self.load_publishers(event_id).await?;
        let before = publishers.len();
        publishers.retain(|publisher| publisher != client);
        if publishers.is_empty() {
            self.cache.delete(&publish_side_key(event_id)).await?;
        } else if publishers.len() != before {
            self.store_publishers(event_id, &publishers).await?;
        }
        Ok(())
    }

    async fn load_publishers(&self, event_id: &str) -> Result<Vec<ClientId>> {
        let Some(raw) = self.cache.get(&publish_side_key(event_id)).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_slice(&raw).map_err(|err| {
            PoolError::CacheUnavailable(StorageError::Unavailable(format!(
                "corrupt publishers for {event_id}: {err}"
            )))
        })
    }

    async fn store_publishers(&self, event_id: &str, publishers: &[ClientId]) -> Result<()> {
        let value = serde_json::to_vec(publishers).map_err(|err| {
            PoolError::CacheUnavailable(StorageError::Unavailable(format!(
                "encode publishers: {err}"
            )))
        })?;
        self.cache
            .set(&publish_side_key(event_id), Bytes::from(value), Some(self.ttl))
            .await?;
        Ok(())
    }
}

fn subscription_key(global: &str) -> String {
    format!("{SUBSCRIPTION_KEY_PREFIX}{global}")
}

fn publish_side_key(event_id: &str) -> String {
    format!("{PUBLISH_KEY_PREFIX}{event_id}")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
