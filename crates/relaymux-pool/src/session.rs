// Downstream side of the pool: one ClientSession per client connection.
// The session owns its local subscription table outright; nothing else
// mutates it. Replies reach the client through a bounded outbox.
use relaymux_wire::Message;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::aggregator::Completion;
use crate::pool::Pool;
use crate::rewriter::{ClientId, publish_key, to_global};
use crate::{PoolError, Result};

const NO_ACK_MESSAGE: &str = "error: no relay acknowledged the event";

/// Queue a frame for a client without waiting. A full outbox drops the frame.
pub(crate) fn deliver(outbox: &mpsc::Sender<String>, client: &ClientId, frame: String) {
    match outbox.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            metrics::counter!("relaymux_client_queue_full_total").increment(1);
            tracing::warn!(client = %client, "client outbox full; dropping frame");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::trace!(client = %client, "client gone; dropping frame");
        }
    }
}

pub struct ClientSession {
    id: ClientId,
    pool: Pool,
    outbox: mpsc::Sender<String>,
    // local id -> global id
    subscriptions: HashMap<String, String>,
    // publish key -> event id, for publications that may still be pending
    publications: HashMap<String, String>,
}

impl ClientSession {
    /// Register a new session with `pool`. Frames for the client arrive on
    /// the returned receiver.
    pub fn open(pool: &Pool) -> (Self, mpsc::Receiver<String>) {
        let id = ClientId::generate();
        let (outbox, rx) = mpsc::channel(pool.config().client_queue.max(1));
        pool.register_session(id.clone(), outbox.clone());
        tracing::debug!(client = %id, "session opened");
        let session = Self {
            id,
            pool: pool.clone(),
            outbox,
            subscriptions: HashMap::new(),
            publications: HashMap::new(),
        };
        (session, rx)
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn subscription_ids(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }

    /// Apply one frame sent by the client. `MalformedFrame` means the
    /// connection should be terminated.
    pub async fn handle_frame(&mut self, raw: &str) -> Result<()> {
        let message = Message::parse(raw)?;
        match message {
            Message::Request { .. } => self.subscribe(message).await,
            Message::Close { subscription_id } => self.unsubscribe(&subscription_id).await,
            Message::Publish { .. } => self.publish(message).await,
            _ => Err(PoolError::MalformedFrame(relaymux_wire::Error::MalformedFrame(
                "relay-only message kind from client",
            ))),
        }
    }

    async fn subscribe(&mut self, request: Message) -> Result<()> {
        let Some(local) = request.subscription_id().map(str::to_string) else {
            let err = relaymux_wire::Error::MalformedFrame("subscribe requires a subscription id");
            return Err(err.into());
        };
        if self.subscriptions.contains_key(&local) {
            self.unsubscribe(&local).await?;
        }
        // Two long ids can truncate to the same global id; the newer one wins.
        let global = to_global(&local, &self.id);
        let collision = self
            .subscriptions
            .iter()
            .find(|(_, existing)| **existing == global)
            .map(|(local, _)| local.clone());
        if let Some(previous) = collision {
            self.unsubscribe(&previous).await?;
        }

        let global = self.pool.rewriter().bind_subscription(&local, &self.id).await?;
        let outbox = self.outbox.clone();
        let client = self.id.clone();
        let eose = Message::Eose {
            subscription_id: local.clone(),
        }
        .encode();
        self.pool.subscriptions().track(
            global.clone(),
            self.pool.count_connected(),
            self.pool.config().event_limit,
            move |completion: Completion| {
                tracing::debug!(
                    client = %client,
                    reason = completion.reason.as_str(),
                    reported = completion.reported,
                    expected = completion.expected,
                    "end of stored events"
                );
                deliver(&outbox, &client, eose);
            },
        );
        self.subscriptions.insert(local, global);
        self.pool.broadcast_to_upstreams(&request, &self.id);
        Ok(())
    }

    async fn unsubscribe(&mut self, local: &str) -> Result<()> {
        let Some(global) = self.subscriptions.remove(local) else {
            return Ok(());
        };
        self.pool.subscriptions().cancel(&global);
        let close = Message::Close {
            subscription_id: local.to_string(),
        };
        self.pool.broadcast_to_upstreams(&close, &self.id);
        self.pool.rewriter().forget_subscription(&global).await
    }

    async fn publish(&mut self, message: Message) -> Result<()> {
        let Some(event_id) = message.event_id().map(str::to_string) else {
            let err = relaymux_wire::Error::MalformedFrame("push-event requires an event id");
            return Err(err.into());
        };
        let pool = &self.pool;
        self.publications.retain(|key, _| pool.publications().is_pending(key));

        self.pool.rewriter().bind_publish(&event_id, &self.id).await?;
        let key = publish_key(&event_id, &self.id);
        let outbox = self.outbox.clone();
        let client = self.id.clone();
        let rewriter = self.pool.rewriter().clone();
        let tracked_event = event_id.clone();
        self.pool.publications().track(
            key.clone(),
            self.pool.count_connected(),
            None,
            move |completion: Completion| {
                let accepted = completion.reported > 0;
                let reply = Message::Ok {
                    event_id: event_id.clone(),
                    accepted,
                    message: if accepted {
                        String::new()
                    } else {
                        NO_ACK_MESSAGE.to_string()
                    },
                };
                deliver(&outbox, &client, reply.encode());
                tokio::spawn(async move {
                    if let Err(err) = rewriter.forget_publish(&event_id, &client).await {
                        tracing::debug!(error = %err, "publish mapping cleanup failed");
                    }
                });
            },
        );
        self.publications.insert(key, tracked_event);
        self.pool.broadcast_to_upstreams(&message, &self.id);
        Ok(())
    }

    /// Close every owned subscription upstream, drop pending publications
    /// and leave the pool.
    pub async fn close(mut self) {
        let locals: Vec<String> = self.subscriptions.keys().cloned().collect();
        for local in locals {
            if let Err(err) = self.unsubscribe(&local).await {
                tracing::warn!(client = %self.id, error = %err, "subscription cleanup failed");
            }
        }
        let publications: Vec<(String, String)> = self.publications.drain().collect();
        for (key, event_id) in publications {
            self.pool.publications().cancel(&key);
            if let Err(err) = self.pool.rewriter().forget_publish(&event_id, &self.id).await {
                tracing::warn!(client = %self.id, error = %err, "publication cleanup failed");
            }
        }
        tracing::debug!(client = %self.id, "session closed");
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        // Only reached with live entries when close() was skipped.
        let handle = tokio::runtime::Handle::try_current().ok();
        for (key, event_id) in self.publications.drain() {
            self.pool.publications().cancel(&key);
            if let Some(handle) = &handle {
                let rewriter = self.pool.rewriter().clone();
                let client = self.id.clone();
                handle.spawn(async move {
                    let _ = rewriter.forget_publish(&event_id, &client).await;
                });
            }
        }
        for (local, global) in self.subscriptions.drain() {
            self.pool.subscriptions().cancel(&global);
            let close = Message::Close {
                subscription_id: local,
            };
            self.pool.broadcast_to_upstreams(&close, &self.id);
            if let Some(handle) = &handle {
                let rewriter = self.pool.rewriter().clone();
                handle.spawn(async move {
                    let _ = rewriter.forget_subscription(&global).await;
                });
            }
        }
        self.pool.unregister_session(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FanIn;
    use crate::config::PoolConfig;
    use relaymux_storage::EphemeralCache;
    use std::sync::Arc;
    use std::time::Duration;

    const A: &str = "wss://relay-a.example";
    const B: &str = "wss://relay-b.example";
    const WINDOW: Duration = Duration::from_millis(2400);

    struct Harness {
        pool: Pool,
        relay_a: mpsc::Receiver<String>,
        relay_b: mpsc::Receiver<String>,
    }

    fn harness(configure: impl FnOnce(&mut PoolConfig)) -> Harness {
        let mut config = PoolConfig::new(vec![A.to_string(), B.to_string()]);
        configure(&mut config);
        let pool = Pool::new(config, Arc::new(EphemeralCache::new()));
        let relay_a = pool.connect_fake(A);
        let relay_b = pool.connect_fake(B);
        Harness {
            pool,
            relay_a,
            relay_b,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn one_event_and_one_eose_across_two_relays() {
        let mut h = harness(|_| {});
        let (mut session, mut client) = ClientSession::open(&h.pool);
        let id = session.id().clone();

        session
            .handle_frame(r#"["REQ","feed",{"kinds":[1]}]"#)
            .await
            .expect("subscribe");
        let upstream_req = format!(r#"["REQ","feed:{id}",{{"kinds":[1]}}]"#);
        assert_eq!(drain(&mut h.relay_a), vec![upstream_req.clone()]);
        assert_eq!(drain(&mut h.relay_b), vec![upstream_req]);

        let event = format!(r#"["EVENT","feed:{id}",{{"id":"e1","kind":1}}]"#);
        h.pool.fan_in(&event, A).await.expect("from a");
        tokio::time::advance(Duration::from_millis(100)).await;
        h.pool.fan_in(&event, B).await.expect("from b");

        let eose = format!(r#"["EOSE","feed:{id}"]"#);
        assert_eq!(h.pool.fan_in(&eose, A).await.expect("eose a"), FanIn::Counted);
        assert_eq!(h.pool.fan_in(&eose, B).await.expect("eose b"), FanIn::Completed);

        assert_eq!(
            drain(&mut client),
            vec![
                r#"["EVENT","feed",{"id":"e1","kind":1}]"#.to_string(),
                r#"["EOSE","feed"]"#.to_string(),
            ]
        );

        // No second EOSE once the deadline passes.
        tokio::time::sleep(WINDOW * 2).await;
        assert!(drain(&mut client).is_empty());
        // Live events keep flowing after EOSE.
        let live = format!(r#"["EVENT","feed:{id}",{{"id":"e2"}}]"#);
        h.pool.fan_in(&live, A).await.expect("live");
        assert_eq!(drain(&mut client).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_relay_is_covered_by_the_deadline() {
        let h = harness(|_| {});
        let (mut session, mut client) = ClientSession::open(&h.pool);
        let id = session.id().clone();
        session
            .handle_frame(r#"["REQ","feed",{}]"#)
            .await
            .expect("subscribe");
        h.pool
            .fan_in(&format!(r#"["EOSE","feed:{id}"]"#), A)
            .await
            .expect("eose");
        assert!(drain(&mut client).is_empty());

        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
        assert_eq!(drain(&mut client), vec![r#"["EOSE","feed"]"#.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_connected_relays_means_timeout_only() {
        let h = harness(|_| {});
        h.pool.disconnect_fake(A);
        h.pool.disconnect_fake(B);
        let (mut session, mut client) = ClientSession::open(&h.pool);
        session
            .handle_frame(r#"["REQ","feed",{}]"#)
            .await
            .expect("subscribe");
        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
        assert_eq!(drain(&mut client), vec![r#"["EOSE","feed"]"#.to_string()]);
    }

    #[tokio::test]
    async fn closing_a_session_cascades_to_every_subscription() {
        let mut h = harness(|_| {});
        let (mut session, _client) = ClientSession::open(&h.pool);
        let id = session.id().clone();
        session.handle_frame(r#"["REQ","one",{}]"#).await.expect("one");
        session.handle_frame(r#"["REQ","two",{}]"#).await.expect("two");
        drain(&mut h.relay_a);
        drain(&mut h.relay_b);

        session.close().await;

        let mut closes = drain(&mut h.relay_a);
        closes.sort();
        assert_eq!(
            closes,
            vec![
                format!(r#"["CLOSE","one:{id}"]"#),
                format!(r#"["CLOSE","two:{id}"]"#),
            ]
        );
        assert_eq!(drain(&mut h.relay_b).len(), 2);

        for local in ["one", "two"] {
            let event = format!(r#"["EVENT","{local}:{id}",{{"id":"late-{local}"}}]"#);
            assert!(matches!(
                h.pool.fan_in(&event, A).await,
                Err(PoolError::UnknownSubscription(_))
            ));
        }
        let stats = h.pool.stats().await.expect("stats");
        assert_eq!(stats.sessions, 0);
        assert_eq!(stats.pending_subscriptions, 0);
    }

    #[tokio::test]
    async fn close_request_cancels_the_pending_eose() {
        let mut h = harness(|_| {});
        let (mut session, _client) = ClientSession::open(&h.pool);
        let id = session.id().clone();
        session.handle_frame(r#"["REQ","feed",{}]"#).await.expect("req");
        session.handle_frame(r#"["CLOSE","feed"]"#).await.expect("close");
        assert_eq!(
            drain(&mut h.relay_a).last().map(String::as_str),
            Some(format!(r#"["CLOSE","feed:{id}"]"#).as_str())
        );
        assert_eq!(h.pool.stats().await.expect("stats").pending_subscriptions, 0);
        assert_eq!(session.subscription_ids().count(), 0);
    }

    #[tokio::test]
    async fn resubscribing_replaces_the_previous_subscription() {
        let mut h = harness(|_| {});
        let (mut session, _client) = ClientSession::open(&h.pool);
        let id = session.id().clone();
        session.handle_frame(r#"["REQ","feed",{"kinds":[1]}]"#).await.expect("first");
        session.handle_frame(r#"["REQ","feed",{"kinds":[7]}]"#).await.expect("second");
        assert_eq!(
            drain(&mut h.relay_a),
            vec![
                format!(r#"["REQ","feed:{id}",{{"kinds":[1]}}]"#),
                format!(r#"["CLOSE","feed:{id}"]"#),
                format!(r#"["REQ","feed:{id}",{{"kinds":[7]}}]"#),
            ]
        );
        assert_eq!(session.subscription_ids().count(), 1);
    }

    #[tokio::test]
    async fn truncation_collisions_keep_the_newest_subscription() {
        let h = harness(|_| {});
        let (mut session, _client) = ClientSession::open(&h.pool);
        let first = format!("{}-first", "x".repeat(70));
        let second = format!("{}-second", "x".repeat(70));
        session
            .handle_frame(&format!(r#"["REQ","{first}",{{}}]"#))
            .await
            .expect("first");
        session
            .handle_frame(&format!(r#"["REQ","{second}",{{}}]"#))
            .await
            .expect("second");
        let ids: Vec<&str> = session.subscription_ids().collect();
        assert_eq!(ids, vec![second.as_str()]);
    }

    #[tokio::test]
    async fn relay_only_frames_from_clients_are_protocol_errors() {
        let h = harness(|_| {});
        let (mut session, _client) = ClientSession::open(&h.pool);
        for frame in [
            r#"["EOSE","feed"]"#,
            r#"["OK","e1",true,""]"#,
            r#"["NOTICE","hi"]"#,
            r#"["EVENT","feed",{"id":"e1"}]"#,
            r#"[]"#,
            r#"["AUTH","x"]"#,
        ] {
            assert!(
                matches!(
                    session.handle_frame(frame).await,
                    Err(PoolError::MalformedFrame(_))
                ),
                "{frame}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publish_acknowledges_once_and_forwards_denials() {
        let mut h = harness(|_| {});
        let (mut session, mut client) = ClientSession::open(&h.pool);
        session
            .handle_frame(r#"["EVENT",{"id":"e1","kind":1}]"#)
            .await
            .expect("publish");
        assert_eq!(drain(&mut h.relay_a), vec![r#"["EVENT",{"id":"e1","kind":1}]"#.to_string()]);
        assert_eq!(drain(&mut h.relay_b).len(), 1);

        let denied = r#"["OK","e1",false,"blocked: spam"]"#;
        assert_eq!(h.pool.fan_in(denied, B).await.expect("denial"), FanIn::Forwarded);
        assert_eq!(drain(&mut client), vec![denied.to_string()]);

        assert_eq!(
            h.pool.fan_in(r#"["OK","e1",true,""]"#, A).await.expect("accept"),
            FanIn::Counted
        );
        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
        assert_eq!(drain(&mut client), vec![r#"["OK","e1",true,""]"#.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_completes_when_every_relay_accepts() {
        let h = harness(|_| {});
        let (mut session, mut client) = ClientSession::open(&h.pool);
        session
            .handle_frame(r#"["EVENT",{"id":"e2"}]"#)
            .await
            .expect("publish");
        let ok = r#"["OK","e2",true,""]"#;
        h.pool.fan_in(ok, A).await.expect("a");
        assert_eq!(h.pool.fan_in(ok, B).await.expect("b"), FanIn::Completed);
        assert_eq!(drain(&mut client), vec![ok.to_string()]);

        // The side table is cleared, so a straggler is unknown.
        tokio::task::yield_now().await;
        assert!(matches!(
            h.pool.fan_in(ok, A).await,
            Err(PoolError::UnknownSubscription(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_publish_reports_failure() {
        let h = harness(|_| {});
        let (mut session, mut client) = ClientSession::open(&h.pool);
        session
            .handle_frame(r#"["EVENT",{"id":"e3"}]"#)
            .await
            .expect("publish");
        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
        assert_eq!(
            drain(&mut client),
            vec![format!(r#"["OK","e3",false,"{NO_ACK_MESSAGE}"]"#)]
        );
    }

    #[tokio::test]
    async fn closing_a_session_forgets_its_publications() {
        let h = harness(|_| {});
        let (mut session, _client) = ClientSession::open(&h.pool);
        session
            .handle_frame(r#"["EVENT",{"id":"e1"}]"#)
            .await
            .expect("publish");
        assert!(h.pool.rewriter().resolve_publishers("e1").await.is_ok());

        session.close().await;
        assert!(matches!(
            h.pool.rewriter().resolve_publishers("e1").await,
            Err(PoolError::UnknownSubscription(_))
        ));
        let stats = h.pool.stats().await.expect("stats");
        assert_eq!(stats.pending_publications, 0);
        assert_eq!(stats.cache_entries, 0);
    }

    #[tokio::test]
    async fn dropping_a_session_forgets_its_publications() {
        let h = harness(|_| {});
        let (mut session, _client) = ClientSession::open(&h.pool);
        session
            .handle_frame(r#"["EVENT",{"id":"e1"}]"#)
            .await
            .expect("publish");
        drop(session);
        tokio::task::yield_now().await;
        assert!(matches!(
            h.pool.rewriter().resolve_publishers("e1").await,
            Err(PoolError::UnknownSubscription(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn same_event_from_two_clients_is_acknowledged_to_both() {
        let h = harness(|_| {});
        let (mut first, mut first_rx) = ClientSession::open(&h.pool);
        let (mut second, mut second_rx) = ClientSession::open(&h.pool);
        for session in [&mut first, &mut second] {
            session
                .handle_frame(r#"["EVENT",{"id":"e1"}]"#)
                .await
                .expect("publish");
        }

        let ok = r#"["OK","e1",true,""]"#;
        assert_eq!(h.pool.fan_in(ok, A).await.expect("a"), FanIn::Counted);
        assert_eq!(h.pool.fan_in(ok, B).await.expect("b"), FanIn::Completed);
        assert_eq!(drain(&mut first_rx), vec![ok.to_string()]);
        assert_eq!(drain(&mut second_rx), vec![ok.to_string()]);

        tokio::time::sleep(WINDOW * 2).await;
        assert!(drain(&mut first_rx).is_empty());
        assert!(drain(&mut second_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn denials_reach_every_pending_publisher() {
        let h = harness(|_| {});
        let (mut first, mut first_rx) = ClientSession::open(&h.pool);
        let (mut second, mut second_rx) = ClientSession::open(&h.pool);
        for session in [&mut first, &mut second] {
            session
                .handle_frame(r#"["EVENT",{"id":"e2"}]"#)
                .await
                .expect("publish");
        }
        let denied = r#"["OK","e2",false,"blocked: spam"]"#;
        h.pool.fan_in(denied, A).await.expect("denial");
        assert_eq!(drain(&mut first_rx), vec![denied.to_string()]);
        assert_eq!(drain(&mut second_rx), vec![denied.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn one_publisher_leaving_keeps_the_other_routed() {
        let h = harness(|_| {});
        let (mut first, _first_rx) = ClientSession::open(&h.pool);
        let (mut second, mut second_rx) = ClientSession::open(&h.pool);
        for session in [&mut first, &mut second] {
            session
                .handle_frame(r#"["EVENT",{"id":"e3"}]"#)
                .await
                .expect("publish");
        }
        first.close().await;

        let ok = r#"["OK","e3",true,""]"#;
        h.pool.fan_in(ok, A).await.expect("a");
        assert_eq!(h.pool.fan_in(ok, B).await.expect("b"), FanIn::Completed);
        assert_eq!(drain(&mut second_rx), vec![ok.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn event_limit_ends_stored_events_early() {
        let h = harness(|config| config.event_limit = Some(2));
        let (mut session, mut client) = ClientSession::open(&h.pool);
        let id = session.id().clone();
        session.handle_frame(r#"["REQ","big",{}]"#).await.expect("req");
        for n in 0..3 {
            let event = format!(r#"["EVENT","big:{id}",{{"id":"e{n}"}}]"#);
            h.pool.fan_in(&event, A).await.expect("event");
        }
        let frames = drain(&mut client);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[2], r#"["EOSE","big"]"#);

        tokio::time::sleep(WINDOW * 2).await;
        assert!(drain(&mut client).is_empty());
    }

    #[tokio::test]
    async fn full_outbox_drops_instead_of_blocking() {
        let h = harness(|config| config.client_queue = 1);
        let (mut session, mut client) = ClientSession::open(&h.pool);
        let id = session.id().clone();
        session.handle_frame(r#"["REQ","feed",{}]"#).await.expect("req");
        for n in 0..3 {
            let event = format!(r#"["EVENT","feed:{id}",{{"id":"e{n}"}}]"#);
            assert_eq!(h.pool.fan_in(&event, A).await.expect("event"), FanIn::Forwarded);
        }
        assert_eq!(drain(&mut client).len(), 1);
    }

    #[tokio::test]
    async fn dropping_a_session_without_close_still_cleans_up() {
        let mut h = harness(|_| {});
        let (mut session, _client) = ClientSession::open(&h.pool);
        let id = session.id().clone();
        session.handle_frame(r#"["REQ","feed",{}]"#).await.expect("req");
        drain(&mut h.relay_a);
        drop(session);

        assert_eq!(drain(&mut h.relay_a), vec![format!(r#"["CLOSE","feed:{id}"]"#)]);
        let stats = h.pool.stats().await.expect("stats");
        assert_eq!(stats.sessions, 0);
        assert_eq!(stats.pending_subscriptions, 0);
    }
}
