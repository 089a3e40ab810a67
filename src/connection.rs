//! The per-connection state machine: wire frame parsing, dispatch by
//! message type, subscription bookkeeping, and reply emission.
//!
//! States: `Opening -> Running -> Closed`. `Opening` is the
//! transport-upgrade step that lives in `main.rs`; everything here is the
//! `Running` state's frame handling. A malformed frame, an unknown message
//! tag, or a handler error never terminates the connection — only a
//! transport send failure does.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::broadcaster::ConnectionId;
use crate::event::Event;
use crate::filter::Filter;
use crate::relay::RelayContext;
use crate::store::EventStore;

/// A parsed client-to-relay message.
#[derive(Debug)]
pub enum ClientMessage {
    Event(Box<Event>),
    Req {
        subscription_id: String,
        filter: Box<Filter>,
    },
    Close(String),
}

/// Parse one text frame as `["TAG", ...]`. Returns `None` for invalid JSON,
/// a non-array body, an empty array, or an unrecognized/malformed tag —
/// all of which are logged and ignored by the caller, never treated as
/// fatal.
pub fn parse_client_message(text: &str) -> Option<ClientMessage> {
    let value: Value = serde_json::from_str(text).ok()?;
    let arr = value.as_array()?;
    let tag = arr.first()?.as_str()?;

    match tag {
        "EVENT" if arr.len() == 2 => {
            let event: Event = serde_json::from_value(arr[1].clone()).ok()?;
            Some(ClientMessage::Event(Box::new(event)))
        }
        "REQ" if arr.len() == 3 => {
            let subscription_id = arr[1].as_str()?.to_string();
            let filter: Filter = serde_json::from_value(arr[2].clone()).ok()?;
            Some(ClientMessage::Req {
                subscription_id,
                filter: Box::new(filter),
            })
        }
        "CLOSE" if arr.len() == 2 => {
            let subscription_id = arr[1].as_str()?.to_string();
            Some(ClientMessage::Close(subscription_id))
        }
        other => {
            warn!("unrecognized or malformed message tag: {other}");
            None
        }
    }
}

fn frame_ok(id: &str, accepted: bool, message: &str) -> String {
    serde_json::json!(["OK", id, accepted, message]).to_string()
}

fn frame_event(sub_id: &str, event: &Event) -> String {
    serde_json::json!(["EVENT", sub_id, event]).to_string()
}

fn frame_eose(sub_id: &str) -> String {
    serde_json::json!(["EOSE", sub_id]).to_string()
}

fn frame_notice(message: &str) -> String {
    serde_json::json!(["NOTICE", message]).to_string()
}

/// One live client session on one relay.
pub struct Connection {
    pub id: ConnectionId,
    relay_id: String,
    ctx: Arc<RelayContext>,
    store: Arc<dyn EventStore>,
    /// Installed subscriptions, in installation order. A REQ with an
    /// existing subscription id replaces that entry in place rather than
    /// moving it to the end.
    subscriptions: Vec<(String, Filter)>,
    outbound: mpsc::Sender<String>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        relay_id: String,
        ctx: Arc<RelayContext>,
        store: Arc<dyn EventStore>,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        Self {
            id,
            relay_id,
            ctx,
            store,
            subscriptions: Vec::new(),
            outbound,
        }
    }

    async fn send(&self, frame: String) {
        // A full outbound queue here means the peer is too slow to drain
        // its own replies; that is also grounds to eventually close the
        // connection, but a dropped reply is not itself fatal —
        // the transport-level send failure (not this queue) is what
        // terminates the session.
        let _ = self.outbound.try_send(frame);
    }

    /// Dispatch one received text frame.
    pub async fn handle_text(&mut self, text: &str) {
        match parse_client_message(text) {
            Some(ClientMessage::Event(event)) => self.handle_event(*event).await,
            Some(ClientMessage::Req {
                subscription_id,
                filter,
            }) => self.handle_req(subscription_id, *filter).await,
            Some(ClientMessage::Close(subscription_id)) => self.handle_close(&subscription_id),
            None => {
                // Malformed JSON / unexpected arity / unknown tag: already
                // logged by the parser. Nothing to reply with.
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        if let Err(e) = event.verify() {
            self.send(frame_ok(&event.id, false, &e.client_message()))
                .await;
            return;
        }

        if let Err(e) = self
            .ctx
            .policy
            .admit(self.store.as_ref(), &self.relay_id, &event)
            .await
        {
            self.send(frame_ok(&event.id, false, &e.client_message()))
                .await;
            return;
        }

        match self.store.put(&self.relay_id, &event).await {
            Ok(()) => {
                self.send(frame_ok(&event.id, true, "")).await;

                if let Err(e) = self
                    .ctx
                    .policy
                    .apply_deletion(self.store.as_ref(), &self.relay_id, &event)
                    .await
                {
                    warn!("deletion side effect failed: {e}");
                }

                self.ctx.broadcaster.broadcast(self.id, &event).await;
            }
            Err(e) => {
                self.send(frame_ok(&event.id, false, &e.client_message()))
                    .await;
            }
        }
    }

    async fn handle_req(&mut self, subscription_id: String, filter: Filter) {
        match self.store.query(&self.relay_id, &filter).await {
            Ok(events) => {
                for event in &events {
                    self.send(frame_event(&subscription_id, event)).await;
                }
                self.send(frame_eose(&subscription_id)).await;
                self.install_filter(subscription_id, filter);
            }
            Err(e) => {
                self.send(frame_notice(&format!(
                    "failed to query events for {subscription_id}: {e}"
                )))
                .await;
            }
        }
    }

    fn install_filter(&mut self, subscription_id: String, filter: Filter) {
        if let Some(existing) = self
            .subscriptions
            .iter_mut()
            .find(|(id, _)| *id == subscription_id)
        {
            existing.1 = filter;
        } else {
            self.subscriptions.push((subscription_id, filter));
        }
    }

    fn handle_close(&mut self, subscription_id: &str) {
        self.subscriptions.retain(|(id, _)| id != subscription_id);
    }

    /// Called when this relay's broadcaster delivers a newly accepted
    /// event. A single event may fan out to multiple subscriptions on this
    /// connection if more than one independently matches.
    pub async fn notify(&self, event: &Event) {
        for (subscription_id, filter) in &self.subscriptions {
            if filter.matches(event) {
                self.send(frame_event(subscription_id, event)).await;
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::signed_event;
    use crate::policy::RelaySpec;
    use crate::relay::{RelayConfig, RelayContext};
    use crate::store::fake::FakeEventStore;
    use crate::policy::RelayPolicy;
    use crate::broadcaster::Broadcaster;
    use std::sync::Arc as StdArc;

    fn test_ctx() -> StdArc<RelayContext> {
        StdArc::new(RelayContext {
            config: RelayConfig {
                id: "r1".to_string(),
                name: "t".to_string(),
                description: "t".to_string(),
                pubkey: "ab".repeat(32),
                contact: "".to_string(),
                active: true,
                spec: RelaySpec::default(),
            },
            policy: RelayPolicy::new(RelaySpec::default()),
            broadcaster: Broadcaster::new(),
        })
    }

    async fn new_connection(
        id: ConnectionId,
        ctx: StdArc<RelayContext>,
        store: StdArc<dyn EventStore>,
    ) -> (Connection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(32);
        (
            Connection::new(id, "r1".to_string(), ctx, store, tx),
            rx,
        )
    }

    #[tokio::test]
    async fn parses_event_req_close_and_ignores_garbage() {
        assert!(matches!(
            parse_client_message(r#"["CLOSE","sub1"]"#),
            Some(ClientMessage::Close(_))
        ));
        assert!(parse_client_message("not json").is_none());
        assert!(parse_client_message(r#"{"not":"an array"}"#).is_none());
        assert!(parse_client_message(r#"["UNKNOWN","x"]"#).is_none());
        assert!(parse_client_message(r#"["REQ","only-two"]"#).is_none());
    }

    #[tokio::test]
    async fn accept_and_fan_out_excludes_submitter() {
        let ctx = test_ctx();
        let store: StdArc<dyn EventStore> = StdArc::new(FakeEventStore::new());

        let (id1, mut rx1) = ctx.broadcaster.attach(10).await;
        let (mut c1, mut out1) = new_connection(id1, ctx.clone(), store.clone()).await;
        let (id2, mut rx2) = ctx.broadcaster.attach(10).await;
        let (mut c2, mut out2) = new_connection(id2, ctx.clone(), store.clone()).await;

        c1.handle_text(r#"["REQ","s",{"kinds":[1]}]"#).await;
        assert_eq!(out1.recv().await.unwrap(), r#"["EOSE","s"]"#);

        let e = signed_event(100, 1, vec![], "hi");
        let event_json = serde_json::to_string(&e).unwrap();
        c2.handle_text(&format!(r#"["EVENT",{event_json}]"#)).await;

        let ok = out2.recv().await.unwrap();
        assert_eq!(ok, frame_ok(&e.id, true, ""));

        let delivered = rx1.recv().await.unwrap();
        c1.notify(&delivered).await;
        let fanned = out1.recv().await.unwrap();
        assert_eq!(fanned, frame_event("s", &e));

        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn reject_bad_signature_does_not_persist() {
        let ctx = test_ctx();
        let store: StdArc<dyn EventStore> = StdArc::new(FakeEventStore::new());
        let (id1, _rx1) = ctx.broadcaster.attach(10).await;
        let (mut c1, mut out1) = new_connection(id1, ctx.clone(), store.clone()).await;

        let mut e = signed_event(1, 1, vec![], "hi");
        let mut sig_bytes = hex::decode(&e.sig).unwrap();
        sig_bytes[0] ^= 0x01;
        e.sig = hex::encode(sig_bytes);

        let event_json = serde_json::to_string(&e).unwrap();
        c1.handle_text(&format!(r#"["EVENT",{event_json}]"#)).await;

        let reply = out1.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed[0], "OK");
        assert_eq!(parsed[2], false);

        assert_eq!(store.query("r1", &Filter::default()).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn history_replay_most_recent_first_then_live() {
        let ctx = test_ctx();
        let store: StdArc<dyn EventStore> = StdArc::new(FakeEventStore::new());
        let (id1, _rx1) = ctx.broadcaster.attach(10).await;
        let (mut c1, mut out1) = new_connection(id1, ctx.clone(), store.clone()).await;
        let (id2, mut rx2) = ctx.broadcaster.attach(10).await;
        let (mut c2, mut out2) = new_connection(id2, ctx.clone(), store.clone()).await;

        let e1 = signed_event(100, 1, vec![], "one");
        let e2 = signed_event(200, 1, vec![], "two");
        let e3 = signed_event(300, 2, vec![], "three");
        for e in [&e1, &e2, &e3] {
            let json = serde_json::to_string(e).unwrap();
            c1.handle_text(&format!(r#"["EVENT",{json}]"#)).await;
            out1.recv().await.unwrap(); // drain OK
        }

        c2.handle_text(r#"["REQ","x",{"kinds":[1],"limit":10}]"#)
            .await;
        assert_eq!(out2.recv().await.unwrap(), frame_event("x", &e2));
        assert_eq!(out2.recv().await.unwrap(), frame_event("x", &e1));
        assert_eq!(out2.recv().await.unwrap(), r#"["EOSE","x"]"#);

        let e4 = signed_event(400, 1, vec![], "four");
        let json = serde_json::to_string(&e4).unwrap();
        c1.handle_text(&format!(r#"["EVENT",{json}]"#)).await;
        out1.recv().await.unwrap(); // drain OK

        let delivered = rx2.recv().await.unwrap();
        c2.notify(&delivered).await;
        assert_eq!(out2.recv().await.unwrap(), frame_event("x", &e4));
    }

    #[tokio::test]
    async fn close_removes_subscription_so_future_events_are_not_delivered() {
        let ctx = test_ctx();
        let store: StdArc<dyn EventStore> = StdArc::new(FakeEventStore::new());
        let (id1, _rx1) = ctx.broadcaster.attach(10).await;
        let (mut c1, mut out1) = new_connection(id1, ctx.clone(), store.clone()).await;

        c1.handle_text(r#"["REQ","s",{}]"#).await;
        out1.recv().await.unwrap(); // EOSE
        assert_eq!(c1.subscription_count(), 1);

        c1.handle_text(r#"["CLOSE","s"]"#).await;
        assert_eq!(c1.subscription_count(), 0);

        let e = signed_event(1, 1, vec![], "hi");
        c1.notify(&e).await;
        assert!(out1.try_recv().is_err());
    }

    #[tokio::test]
    async fn installing_req_with_same_sub_id_replaces_filter() {
        let ctx = test_ctx();
        let store: StdArc<dyn EventStore> = StdArc::new(FakeEventStore::new());
        let (id1, _rx1) = ctx.broadcaster.attach(10).await;
        let (mut c1, mut out1) = new_connection(id1, ctx.clone(), store.clone()).await;

        c1.handle_text(r#"["REQ","s",{"kinds":[1]}]"#).await;
        out1.recv().await.unwrap();
        c1.handle_text(r#"["REQ","s",{"kinds":[2]}]"#).await;
        out1.recv().await.unwrap();

        assert_eq!(c1.subscription_count(), 1);

        let kind1 = signed_event(1, 1, vec![], "");
        let kind2 = signed_event(1, 2, vec![], "");
        c1.notify(&kind1).await;
        assert!(out1.try_recv().is_err());
        c1.notify(&kind2).await;
        assert_eq!(out1.try_recv().unwrap(), frame_event("s", &kind2));
    }
}
