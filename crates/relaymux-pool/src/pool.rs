// Connection pool: one Upstream per relay URL, a single fan-in task that
// deduplicates and routes relay frames to client sessions, and the shared
// completion aggregators sessions register their operations with.
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use relaymux_storage::StorageApi;
use relaymux_wire::Message;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::aggregator::CompletionAggregator;
use crate::config::PoolConfig;
use crate::rewriter::{ClientId, Rewriter, publish_key, to_global};
use crate::session::deliver;
use crate::upstream::{DialSettings, InboundFrame, Upstream, UpstreamSnapshot};
use crate::{PoolError, PoolEvent, Result};

const DEDUP_KEY_PREFIX: &str = "dedup:";
const EVENTS_CAPACITY: usize = 256;

/// What became of one inbound relay frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanIn {
    // Delivered to one or more sessions.
    Forwarded,
    // Identical bytes already forwarded within the dedup window.
    Duplicate,
    // Completion signal recorded; the operation is still pending.
    Counted,
    // Completion signal that fired the consolidated reply.
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub upstreams: usize,
    pub connected: usize,
    pub sessions: usize,
    pub pending_subscriptions: usize,
    pub pending_publications: usize,
    pub cache_entries: usize,
}

/// Shared handle to the pool. Cloning is cheap.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    upstreams: BTreeMap<String, Arc<Upstream>>,
    cache: Arc<dyn StorageApi>,
    rewriter: Rewriter,
    sessions: RwLock<HashMap<ClientId, mpsc::Sender<String>>>,
    subscriptions: CompletionAggregator<String>,
    publications: CompletionAggregator<String>,
    events: broadcast::Sender<PoolEvent>,
    inbound: Mutex<Option<(mpsc::Sender<InboundFrame>, mpsc::Receiver<InboundFrame>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Pool {
    pub fn new(config: PoolConfig, cache: Arc<dyn StorageApi>) -> Self {
        let upstreams = config
            .relays
            .iter()
            .map(|url| {
                let upstream = Upstream::new(url, config.max_attempts, config.backoff_reset);
                (url.clone(), Arc::new(upstream))
            })
            .collect();
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let inbound = mpsc::channel(config.upstream_queue.max(1));
        Self {
            inner: Arc::new(PoolInner {
                rewriter: Rewriter::new(Arc::clone(&cache), config.mapping_ttl),
                subscriptions: CompletionAggregator::new("eose", config.completion_timeout),
                publications: CompletionAggregator::new("ok", config.completion_timeout),
                upstreams,
                cache,
                sessions: RwLock::new(HashMap::new()),
                events,
                inbound: Mutex::new(Some(inbound)),
                tasks: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    /// Spawn one connection task per relay plus the fan-in task. Calling it
    /// again is a no-op.
    pub fn start(&self) {
        let Some((inbound_tx, mut inbound_rx)) = self.inner.inbound.lock().take() else {
            return;
        };
        let settings = DialSettings {
            connect_timeout: self.inner.config.connect_timeout,
            queue: self.inner.config.upstream_queue.max(1),
        };
        let mut tasks = self.inner.tasks.lock();
        for upstream in self.inner.upstreams.values() {
            tasks.push(tokio::spawn(Arc::clone(upstream).run(
                settings,
                inbound_tx.clone(),
                self.inner.events.clone(),
            )));
        }
        drop(inbound_tx);

        // Holds a weak reference so dropping the last Pool handle ends the task.
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        tasks.push(tokio::spawn(async move {
            while let Some(InboundFrame { source, frame }) = inbound_rx.recv().await {
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                Pool { inner }.handle_inbound(&frame, &source).await;
            }
        }));
        tracing::info!(relays = self.inner.upstreams.len(), "relay pool started");
    }

    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub(crate) fn rewriter(&self) -> &Rewriter {
        &self.inner.rewriter
    }

    pub(crate) fn subscriptions(&self) -> &CompletionAggregator<String> {
        &self.inner.subscriptions
    }

    pub(crate) fn publications(&self) -> &CompletionAggregator<String> {
        &self.inner.publications
    }

    /// Send `message` to every connected relay. Subscribe and close frames
    /// carry the client-local id and are rewritten for `origin`. Returns the
    /// number of relays the frame was queued on.
    pub fn broadcast_to_upstreams(&self, message: &Message, origin: &ClientId) -> usize {
        let frame = match message.subscription_id() {
            Some(local) => message
                .clone()
                .with_subscription_id(to_global(local, origin))
                .encode(),
            None => message.encode(),
        };
        let mut sent = 0;
        for upstream in self.inner.upstreams.values() {
            match upstream.send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(err) => tracing::trace!(error = %err, "skipping relay"),
            }
        }
        if sent == 0 {
            tracing::debug!(
                client = %origin,
                kind = %message.kind(),
                "no connected relay for broadcast"
            );
        }
        sent
    }

    /// Deduplicate, classify and route one frame received from `source`.
    pub async fn fan_in(&self, raw: &str, source: &str) -> Result<FanIn> {
        metrics::counter!("relaymux_frames_in_total").increment(1);
        let message = Message::parse(raw)?;
        if !message.kind().is_relay_only() {
            let err = relaymux_wire::Error::MalformedFrame("client message kind from relay");
            return Err(err.into());
        }

        match message {
            // Completion signals are counted per relay, so identical frames
            // from different relays must not be collapsed here.
            Message::Eose { subscription_id } => {
                self.complete_subscription(subscription_id, source).await
            }
            Message::Ok {
                event_id,
                accepted: true,
                ..
            } => self.complete_publication(event_id, source).await,
            message => {
                if !self.first_sighting(raw).await? {
                    metrics::counter!("relaymux_frames_duplicate_total").increment(1);
                    return Ok(FanIn::Duplicate);
                }
                self.route(message).await
            }
        }
    }

    async fn route(&self, message: Message) -> Result<FanIn> {
        match message {
            Message::Event {
                subscription_id,
                event,
            } => {
                let mapping = self.inner.rewriter.resolve_subscription(&subscription_id).await?;
                let frame = Message::Event {
                    subscription_id: mapping.local_id,
                    event,
                }
                .encode();
                self.deliver_to(&mapping.client_id, frame)?;
                self.inner.subscriptions.record_delivery(&subscription_id);
                Ok(FanIn::Forwarded)
            }
            // A denial is final for that relay and goes straight to every
            // client still waiting on the event.
            denial @ Message::Ok { .. } => {
                let event_id = denial.event_id().unwrap_or_default().to_string();
                let frame = denial.encode();
                let publishers = self.pending_publishers(&event_id).await?;
                let sessions = self.inner.sessions.read();
                for client in &publishers {
                    if let Some(outbox) = sessions.get(client) {
                        deliver(outbox, client, frame.clone());
                    }
                }
                Ok(FanIn::Forwarded)
            }
            notice @ Message::Notice { .. } => {
                let frame = notice.encode();
                let sessions = self.inner.sessions.read();
                for (client, outbox) in sessions.iter() {
                    deliver(outbox, client, frame.clone());
                }
                Ok(FanIn::Forwarded)
            }
            _ => Err(relaymux_wire::Error::MalformedFrame("client message kind from relay").into()),
        }
    }

    async fn complete_subscription(&self, global: String, source: &str) -> Result<FanIn> {
        if !self.inner.subscriptions.is_pending(&global) {
            // Late signal after the consolidated reply, or nobody owns it.
            self.inner.rewriter.resolve_subscription(&global).await?;
            return Ok(FanIn::Counted);
        }
        match self.inner.subscriptions.signal(&global, source) {
            Some(_) => Ok(FanIn::Completed),
            None => Ok(FanIn::Counted),
        }
    }

    async fn complete_publication(&self, event_id: String, source: &str) -> Result<FanIn> {
        let mut completed = false;
        for client in self.pending_publishers(&event_id).await? {
            let key = publish_key(&event_id, &client);
            completed |= self.inner.publications.signal(&key, source).is_some();
        }
        Ok(if completed {
            FanIn::Completed
        } else {
            FanIn::Counted
        })
    }

    // Publishers of `event_id` whose acknowledgement is still outstanding.
    async fn pending_publishers(&self, event_id: &str) -> Result<Vec<ClientId>> {
        let publishers: Vec<ClientId> = self
            .inner
            .rewriter
            .resolve_publishers(event_id)
            .await?
            .into_iter()
            .filter(|client| {
                let key = publish_key(event_id, client);
                self.inner.publications.is_pending(&key)
            })
            .collect();
        if publishers.is_empty() {
            return Err(PoolError::UnknownSubscription(event_id.to_string()));
        }
        Ok(publishers)
    }

    async fn first_sighting(&self, raw: &str) -> Result<bool> {
        let key = format!("{DEDUP_KEY_PREFIX}{}", hex::encode(Sha256::digest(raw.as_bytes())));
        Ok(self
            .inner
            .cache
            .set_if_absent(&key, Bytes::new(), Some(self.inner.config.dedup_ttl))
            .await?)
    }

    async fn handle_inbound(&self, raw: &str, source: &str) {
        let Err(err) = self.fan_in(raw, source).await else {
            return;
        };
        metrics::counter!("relaymux_frames_dropped_total", "reason" => err.reason()).increment(1);
        match err {
            PoolError::UnknownSubscription(id) => {
                tracing::trace!(
                    source = %source,
                    id = %id,
                    "dropping frame for unknown subscription"
                );
            }
            PoolError::MalformedFrame(err) => {
                tracing::warn!(source = %source, error = %err, "dropping malformed relay frame");
            }
            PoolError::CacheUnavailable(err) => {
                tracing::error!(
                    source = %source,
                    error = %err,
                    "cache fault; dropping relay frame"
                );
            }
            PoolError::UpstreamUnavailable(url) => {
                tracing::debug!(source = %source, url = %url, "relay unavailable");
            }
        }
    }

    fn deliver_to(&self, client: &ClientId, frame: String) -> Result<()> {
        let sessions = self.inner.sessions.read();
        let outbox = sessions
            .get(client)
            .ok_or_else(|| PoolError::UnknownSubscription(client.to_string()))?;
        deliver(outbox, client, frame);
        Ok(())
    }

    pub(crate) fn register_session(&self, client: ClientId, outbox: mpsc::Sender<String>) {
        let mut sessions = self.inner.sessions.write();
        sessions.insert(client, outbox);
        metrics::gauge!("relaymux_clients_connected").set(sessions.len() as f64);
    }

    pub(crate) fn unregister_session(&self, client: &ClientId) {
        let mut sessions = self.inner.sessions.write();
        if sessions.remove(client).is_some() {
            metrics::gauge!("relaymux_clients_connected").set(sessions.len() as f64);
        }
    }

    pub fn count_connected(&self) -> usize {
        self.inner
            .upstreams
            .values()
            .filter(|upstream| upstream.is_connected())
            .count()
    }

    pub fn list_upstream_urls(&self) -> Vec<String> {
        self.inner.upstreams.keys().cloned().collect()
    }

    pub fn upstream_snapshots(&self) -> Vec<UpstreamSnapshot> {
        self.inner
            .upstreams
            .values()
            .map(|upstream| upstream.snapshot())
            .collect()
    }

    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Retry every relay currently backing off. Returns how many were woken.
    pub fn reconnect(&self) -> usize {
        let woken = self
            .inner
            .upstreams
            .values()
            .filter(|upstream| upstream.wake())
            .count();
        if woken > 0 {
            tracing::info!(woken, "reconnecting relays in backoff");
        }
        woken
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        Ok(PoolStats {
            upstreams: self.inner.upstreams.len(),
            connected: self.count_connected(),
            sessions: self.inner.sessions.read().len(),
            pending_subscriptions: self.inner.subscriptions.pending(),
            pending_publications: self.inner.publications.pending(),
            cache_entries: self.inner.cache.len().await?,
        })
    }

    /// Attach an in-memory channel in place of a relay socket.
    #[cfg(test)]
    pub(crate) fn connect_fake(&self, url: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(64);
        if let Some(upstream) = self.inner.upstreams.get(url) {
            upstream.attach(tx);
        }
        rx
    }

    #[cfg(test)]
    pub(crate) fn disconnect_fake(&self, url: &str) {
        if let Some(upstream) = self.inner.upstreams.get(url) {
            upstream.detach();
        }
    }
}
