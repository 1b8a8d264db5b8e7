// One persistent websocket per configured relay.
// Failed or closed connections are redialled at once; after `max_attempts`
// consecutive failures the upstream pauses for `backoff_reset` and then
// starts over with a fresh attempt budget. The pause can be cut short by
// `Pool::reconnect`.
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::{PoolError, PoolEvent};

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl UpstreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamState::Disconnected => "disconnected",
            UpstreamState::Connecting => "connecting",
            UpstreamState::Connected => "connected",
            UpstreamState::Backoff => "backoff",
        }
    }
}

impl fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSnapshot {
    pub url: String,
    pub state: UpstreamState,
    pub attempts: u32,
    // Time left before the next dial while backing off.
    pub retry_in: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectDecision {
    Dial,
    Backoff(Duration),
}

/// Connection state and attempt counter, free of any I/O.
#[derive(Debug)]
pub(crate) struct ReconnectState {
    state: UpstreamState,
    attempts: u32,
    max_attempts: u32,
    backoff_reset: Duration,
    backoff_until: Option<Instant>,
}

impl ReconnectState {
    pub(crate) fn new(max_attempts: u32, backoff_reset: Duration) -> Self {
        Self {
            state: UpstreamState::Disconnected,
            attempts: 0,
            max_attempts,
            backoff_reset,
            backoff_until: None,
        }
    }

    pub(crate) fn connect(&mut self) -> ConnectDecision {
        if self.attempts >= self.max_attempts {
            self.state = UpstreamState::Backoff;
            self.backoff_until = Some(Instant::now() + self.backoff_reset);
            return ConnectDecision::Backoff(self.backoff_reset);
        }
        self.state = UpstreamState::Connecting;
        ConnectDecision::Dial
    }

    pub(crate) fn opened(&mut self) {
        self.state = UpstreamState::Connected;
        self.attempts = 0;
    }

    /// Returns true when the connection had been established.
    pub(crate) fn closed(&mut self) -> bool {
        let was_connected = self.state == UpstreamState::Connected;
        self.state = UpstreamState::Disconnected;
        self.attempts = self.attempts.saturating_add(1);
        was_connected
    }

    pub(crate) fn backoff_elapsed(&mut self) {
        self.state = UpstreamState::Disconnected;
        self.attempts = 0;
        self.backoff_until = None;
    }

    pub(crate) fn state(&self) -> UpstreamState {
        self.state
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn retry_in(&self) -> Option<Duration> {
        self.backoff_until
            .map(|until| until.saturating_duration_since(Instant::now()))
    }
}

/// A raw text frame received from one relay.
#[derive(Debug)]
pub(crate) struct InboundFrame {
    pub source: Arc<str>,
    pub frame: String,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DialSettings {
    pub connect_timeout: Duration,
    pub queue: usize,
}

pub struct Upstream {
    url: Arc<str>,
    status: Mutex<ReconnectState>,
    // Present only while connected.
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    wake: Notify,
}

impl Upstream {
    pub(crate) fn new(url: &str, max_attempts: u32, backoff_reset: Duration) -> Self {
        Self {
            url: Arc::from(url),
            status: Mutex::new(ReconnectState::new(max_attempts, backoff_reset)),
            outbound: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> UpstreamState {
        self.status.lock().state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == UpstreamState::Connected
    }

    pub fn snapshot(&self) -> UpstreamSnapshot {
        let status = self.status.lock();
        UpstreamSnapshot {
            url: self.url.to_string(),
            state: status.state(),
            attempts: status.attempts(),
            retry_in: status.retry_in(),
        }
    }

    /// Queue a frame for this relay without waiting.
    pub fn send(&self, frame: String) -> Result<(), PoolError> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(PoolError::UpstreamUnavailable(self.url.to_string()));
        };
        tx.try_send(frame)
            .map_err(|_| PoolError::UpstreamUnavailable(self.url.to_string()))
    }

    /// Cut a backoff pause short. Returns false when not backing off.
    ///
    /// Only a pause already in progress is woken; nothing is remembered for
    /// the next one.
    pub(crate) fn wake(&self) -> bool {
        let status = self.status.lock();
        if status.state() != UpstreamState::Backoff {
            return false;
        }
        self.wake.notify_waiters();
        true
    }

    pub(crate) fn attach(&self, tx: mpsc::Sender<String>) {
        *self.outbound.lock() = Some(tx);
        self.status.lock().opened();
    }

    pub(crate) fn detach(&self) -> bool {
        self.outbound.lock().take();
        self.status.lock().closed()
    }

    /// Connection loop. Runs until the inbound channel closes.
    pub(crate) async fn run(
        self: Arc<Self>,
        settings: DialSettings,
        inbound: mpsc::Sender<InboundFrame>,
        events: broadcast::Sender<PoolEvent>,
    ) {
        let url = self.url.to_string();
        loop {
            if inbound.is_closed() {
                break;
            }
            // Registered before Backoff is entered so no wake can slip past.
            let woken = self.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();

            let decision = self.status.lock().connect();
            if let ConnectDecision::Backoff(pause) = decision {
                tracing::warn!(
                    url = %url,
                    pause_ms = pause.as_millis() as u64,
                    "relay unreachable; backing off"
                );
                metrics::counter!("relaymux_upstream_backoff_total").increment(1);
                let _ = events.send(PoolEvent::RelayBackoff {
                    url: url.clone(),
                    retry_in_ms: pause.as_millis() as u64,
                });
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = &mut woken => {
                        tracing::info!(url = %url, "backoff cut short");
                    }
                }
                self.status.lock().backoff_elapsed();
                continue;
            }

            let dial = connect_async(url.as_str());
            match tokio::time::timeout(settings.connect_timeout, dial).await {
                Ok(Ok((stream, _))) => {
                    self.drive(stream, settings.queue, &inbound, &events).await;
                }
                Ok(Err(err)) => {
                    tracing::warn!(url = %url, error = %err, "relay connect failed");
                    self.detach();
                }
                Err(_) => {
                    tracing::warn!(url = %url, "relay connect timed out");
                    self.detach();
                }
            }
            metrics::counter!("relaymux_upstream_reconnects_total").increment(1);
        }
        self.outbound.lock().take();
    }

    async fn drive(
        &self,
        stream: RelayStream,
        queue: usize,
        inbound: &mpsc::Sender<InboundFrame>,
        events: &broadcast::Sender<PoolEvent>,
    ) {
        let url = self.url.to_string();
        let (tx, mut rx) = mpsc::channel::<String>(queue);
        self.attach(tx);
        tracing::info!(url = %url, "relay connected");
        metrics::gauge!("relaymux_upstream_connected", "url" => url.clone()).set(1.0);
        let _ = events.send(PoolEvent::RelayAvailable { url: url.clone() });

        let (mut sink, mut source) = stream.split();
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(err) = sink.send(WsMessage::Text(frame)).await {
                        tracing::warn!(url = %url, error = %err, "relay write failed");
                        break;
                    }
                }
                incoming = source.next() => match incoming {
                    Some(Ok(WsMessage::Text(frame))) => {
                        let frame = InboundFrame { source: Arc::clone(&self.url), frame };
                        if inbound.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(url = %url, error = %err, "relay read failed");
                        break;
                    }
                },
            }
        }

        if self.detach() {
            tracing::info!(url = %url, "relay disconnected");
            metrics::gauge!("relaymux_upstream_connected", "url" => url.clone()).set(0.0);
            let _ = events.send(PoolEvent::RelayLost { url });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn fresh_upstream_dials() {
        let mut status = ReconnectState::new(5, Duration::from_secs(600));
        assert_eq!(status.state(), UpstreamState::Disconnected);
        assert_eq!(status.connect(), ConnectDecision::Dial);
        assert_eq!(status.state(), UpstreamState::Connecting);
    }

    #[test]
    fn fifth_consecutive_failure_enters_backoff() {
        let reset = Duration::from_secs(600);
        let mut status = ReconnectState::new(5, reset);
        for _ in 0..4 {
            assert_eq!(status.connect(), ConnectDecision::Dial);
            status.closed();
        }
        assert_eq!(status.attempts(), 4);
        // The close at attempt 4 is retried immediately.
        assert_eq!(status.connect(), ConnectDecision::Dial);
        status.closed();
        assert_eq!(status.connect(), ConnectDecision::Backoff(reset));
        assert_eq!(status.state(), UpstreamState::Backoff);
        assert!(status.retry_in().is_some_and(|left| left <= reset));

        status.backoff_elapsed();
        assert_eq!(status.attempts(), 0);
        assert_eq!(status.retry_in(), None);
        assert_eq!(status.connect(), ConnectDecision::Dial);
    }

    #[test]
    fn successful_open_resets_attempts() {
        let mut status = ReconnectState::new(5, Duration::from_secs(1));
        status.connect();
        status.closed();
        status.connect();
        status.closed();
        status.connect();
        status.opened();
        assert_eq!(status.attempts(), 0);
        assert!(status.closed());
        assert_eq!(status.attempts(), 1);
        assert!(!status.closed());
    }

    #[test]
    fn send_requires_a_live_connection() {
        let upstream = Upstream::new("ws://127.0.0.1:1", 5, Duration::from_secs(1));
        assert!(matches!(
            upstream.send("[]".to_string()),
            Err(PoolError::UpstreamUnavailable(url)) if url == "ws://127.0.0.1:1"
        ));

        let (tx, mut rx) = mpsc::channel(1);
        upstream.attach(tx);
        assert!(upstream.is_connected());
        upstream.send("a".to_string()).expect("queued");
        // Queue full.
        assert!(upstream.send("b".to_string()).is_err());
        assert_eq!(rx.try_recv().expect("frame"), "a");

        upstream.detach();
        assert_eq!(upstream.state(), UpstreamState::Disconnected);
        assert!(upstream.send("c".to_string()).is_err());
    }

    #[test]
    fn wake_only_applies_during_backoff() {
        let upstream = Upstream::new("ws://127.0.0.1:1", 0, Duration::from_secs(1));
        assert!(!upstream.wake());
        upstream.status.lock().connect();
        assert_eq!(upstream.state(), UpstreamState::Backoff);
        assert!(upstream.wake());
    }

    #[tokio::test(start_paused = true)]
    async fn wake_outside_a_pause_is_not_remembered() {
        let upstream = Upstream::new("ws://127.0.0.1:1", 0, Duration::from_secs(60));
        upstream.status.lock().connect();
        // Backing off, but no pause is waiting yet.
        assert!(upstream.wake());

        let woken = upstream.wake.notified();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), woken)
                .await
                .is_err()
        );
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    }

    #[tokio::test]
    async fn unreachable_relay_backs_off_and_wakes() {
        let url = format!("ws://127.0.0.1:{}", unused_port().await);
        let upstream = Arc::new(Upstream::new(&url, 2, Duration::from_secs(3600)));
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let (events_tx, mut events) = broadcast::channel(16);
        let settings = DialSettings {
            connect_timeout: Duration::from_secs(2),
            queue: 8,
        };
        let task = tokio::spawn(Arc::clone(&upstream).run(settings, inbound_tx, events_tx));

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("backoff in time")
            .expect("event");
        assert_eq!(
            event,
            PoolEvent::RelayBackoff {
                url: url.clone(),
                retry_in_ms: 3_600_000
            }
        );
        assert_eq!(upstream.state(), UpstreamState::Backoff);

        // Woken early, it burns a fresh attempt budget and pauses again.
        assert!(upstream.wake());
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("second backoff in time")
            .expect("event");
        assert!(matches!(event, PoolEvent::RelayBackoff { .. }));
        task.abort();
    }

    #[tokio::test]
    async fn relay_frames_reach_the_inbound_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let relay = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(socket).await.expect("handshake");
            let request = ws.next().await.expect("frame").expect("ok");
            ws.send(WsMessage::Text(r#"["EOSE","feed:c1"]"#.to_string()))
                .await
                .expect("send");
            ws.close(None).await.ok();
            request
        });

        let upstream = Arc::new(Upstream::new(&url, 5, Duration::from_secs(60)));
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let (events_tx, mut events) = broadcast::channel(16);
        let settings = DialSettings {
            connect_timeout: Duration::from_secs(2),
            queue: 8,
        };
        let task = tokio::spawn(Arc::clone(&upstream).run(settings, inbound_tx, events_tx));

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("connect in time")
            .expect("event");
        assert_eq!(event, PoolEvent::RelayAvailable { url: url.clone() });
        upstream
            .send(r#"["REQ","feed:c1",{}]"#.to_string())
            .expect("send");

        let frame = tokio::time::timeout(Duration::from_secs(5), inbound_rx.recv())
            .await
            .expect("frame in time")
            .expect("frame");
        assert_eq!(&*frame.source, url.as_str());
        assert_eq!(frame.frame, r#"["EOSE","feed:c1"]"#);

        let request = relay.await.expect("relay task");
        assert_eq!(request, WsMessage::Text(r#"["REQ","feed:c1",{}]"#.to_string()));

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("loss in time")
            .expect("event");
        assert_eq!(event, PoolEvent::RelayLost { url });
        task.abort();
    }
}
