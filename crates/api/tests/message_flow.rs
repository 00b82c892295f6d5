//! End-to-end message flow over in-memory infrastructure
//!
//! Two users on one gateway: live delivery, offline fallback with push, then
//! reconnect, sync, and confirm.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chatgate_api::{
    auth::JwtVerifier,
    presence::{MemoryPresence, PresenceStore},
    queue::{MemoryBroker, Topology, PUSH_TASK_KEY},
    signaling::IceServer,
    social::PgSocialGraph,
    store::{MemoryStore, OfflineStore},
    websocket::{Connection, Flow, Session},
    AppState, Config, Infrastructure,
};
use chatgate_shared::PushStatus;
use serde_json::{json, Value};
use time::Duration;
use tokio::sync::mpsc;

const SECRET: &str = "integration-secret-at-least-32-chars";

struct Harness {
    state: AppState,
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryStore>,
    presence: Arc<MemoryPresence>,
    jwt: JwtVerifier,
}

fn config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".into(),
        gateway_id: "gw-test".into(),
        node_id: 7,
        database_url: "postgres://localhost/unused".into(),
        database_max_connections: 1,
        redis_url: "redis://localhost:6379".into(),
        amqp_url: "amqp://localhost:5672/%2f".into(),
        topology: Topology::default(),
        jwt_secret: SECRET.into(),
        handshake_timeout: StdDuration::from_secs(10),
        read_timeout: StdDuration::from_secs(60),
        ping_interval: StdDuration::from_secs(54),
        write_timeout: StdDuration::from_secs(10),
        outbound_buffer: 32,
        offline_retention_days: 7,
        push_enabled: true,
        push_webhook_url: None,
        ice_servers: IceServer::defaults(),
        signaling_require_token: true,
        embedded_consumers: true,
    }
}

fn harness() -> Harness {
    let config = config();
    let broker = Arc::new(MemoryBroker::new(&config.topology));
    let store = Arc::new(MemoryStore::new());
    let presence = Arc::new(MemoryPresence::new());
    // Social frames are not exercised here; the lazy pool never connects
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy(&config.database_url)
        .unwrap();

    let infra = Infrastructure {
        presence: presence.clone(),
        messages: store.clone(),
        offline: store.clone(),
        push_log: store.clone(),
        social: Arc::new(PgSocialGraph::new(pool)),
        broker: broker.clone(),
    };
    let jwt = JwtVerifier::new(SECRET);
    let state = AppState::with_verifier(config, infra, Arc::new(jwt.clone()));

    Harness {
        state,
        broker,
        store,
        presence,
        jwt,
    }
}

impl Harness {
    async fn login(&self, uid: &str) -> (Session, mpsc::Receiver<String>) {
        let (conn, mut rx) = Connection::new(32);
        let mut session = Session::new(self.state.gateway.clone(), Arc::new(conn));
        session.begin_handshake();

        let token = self.jwt.issue(uid, Duration::hours(1)).unwrap();
        let frame = json!({"type": "login", "payload": {"uid": uid, "token": token}});
        assert_eq!(session.handle_text(&frame.to_string()).await, Flow::Continue);
        assert_eq!(next(&mut rx)["type"], "login_success");
        (session, rx)
    }

    /// Run every stage of the pipeline once, in order
    async fn pump(&self) {
        let topology = self.state.config.topology.clone();
        self.broker
            .drain(&topology.private_message_queue, &self.state.persistence_consumer())
            .await
            .unwrap();
        self.broker
            .drain(&topology.offline_message_queue, &self.state.dispatch_consumer())
            .await
            .unwrap();
        self.broker
            .drain(&topology.push_task_queue, &self.state.push_consumer())
            .await
            .unwrap();
    }
}

fn next(rx: &mut mpsc::Receiver<String>) -> Value {
    serde_json::from_str(&rx.try_recv().expect("frame pending")).unwrap()
}

fn chat(to: &str, content: &str) -> String {
    json!({"type": "chat", "payload": {"to": to, "content": content, "type": "text"}}).to_string()
}

#[tokio::test]
async fn test_live_delivery_then_offline_sync() {
    let h = harness();
    let (mut alice, mut alice_rx) = h.login("alice").await;
    let (mut bob, mut bob_rx) = h.login("bob").await;

    // Live: bob is connected to this gateway
    assert_eq!(alice.handle_text(&chat("bob", "hello")).await, Flow::Continue);
    let ack = next(&mut alice_rx);
    assert_eq!(ack["type"], "chat_response");
    let first_id = ack["payload"]["message_id"].as_i64().unwrap();

    h.pump().await;
    assert_eq!(h.store.message_count(), 1);
    let delivered = next(&mut bob_rx);
    assert_eq!(delivered["type"], "chat");
    assert_eq!(delivered["payload"]["message_id"], first_id);
    assert_eq!(delivered["payload"]["from"], "alice");
    assert_eq!(delivered["payload"]["conversation"], "alice_bob");
    assert!(h.store.offline_entries("bob").is_empty());
    assert!(h.broker.published_with_key(PUSH_TASK_KEY).is_empty());

    // Offline: bob disconnects, the next message is indexed and pushed
    bob.close().await;
    assert!(h.presence.get("bob").await.unwrap().is_none());

    assert_eq!(alice.handle_text(&chat("bob", "are you there?")).await, Flow::Continue);
    let second_id = next(&mut alice_rx)["payload"]["message_id"].as_i64().unwrap();
    assert!(second_id > first_id);

    h.pump().await;
    assert_eq!(h.store.message_count(), 2);
    let entries = h.store.offline_entries("bob");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message_id, second_id);
    let unread = h.presence.unread_counts("bob").await.unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].conversation_id, "alice_bob");
    assert_eq!(unread[0].count, 1);

    let pushes = h.store.push_log();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].user_id, "bob");
    assert_eq!(pushes[0].message_id, second_id);
    assert_eq!(pushes[0].status, PushStatus::Success);

    // Reconnect: sync returns the pending message, confirm clears it
    let (mut bob, mut bob_rx) = h.login("bob").await;
    let sync = json!({"type": "sync_offline_messages", "payload": {"page": 1, "page_size": 20}});
    assert_eq!(bob.handle_text(&sync.to_string()).await, Flow::Continue);
    let batch = next(&mut bob_rx);
    assert_eq!(batch["type"], "offline_messages");
    assert_eq!(batch["payload"]["total"], 1);
    assert_eq!(batch["payload"]["messages"][0]["message_id"], second_id);
    assert_eq!(batch["payload"]["messages"][0]["content"], "are you there?");

    let confirm = json!({"type": "confirm_messages_synced", "payload": {"message_ids": [second_id]}});
    assert_eq!(bob.handle_text(&confirm.to_string()).await, Flow::Continue);
    let confirmed = next(&mut bob_rx);
    assert_eq!(confirmed["type"], "confirm_messages_synced_response");
    assert_eq!(confirmed["payload"]["count"], 1);

    assert!(h.presence.unread_counts("bob").await.unwrap().is_empty());
    let summary = h.store.unread_counts("bob").await.unwrap();
    assert_eq!(summary.total_unread, 0);
}

#[tokio::test]
async fn test_redelivery_does_not_duplicate_offline_state() {
    let h = harness();
    let (mut alice, mut alice_rx) = h.login("alice").await;

    assert_eq!(alice.handle_text(&chat("carol", "ping")).await, Flow::Continue);
    next(&mut alice_rx);

    // Keep a copy of the dispatch envelope to replay it
    h.broker
        .drain(
            &h.state.config.topology.private_message_queue,
            &h.state.persistence_consumer(),
        )
        .await
        .unwrap();
    let dispatched = h.broker.published_with_key(chatgate_api::queue::OFFLINE_MESSAGE_KEY);
    assert_eq!(dispatched.len(), 1);

    h.pump().await;
    let replay = dispatched[0].clone();
    chatgate_api::queue::Broker::publish(
        h.broker.as_ref(),
        &replay.exchange,
        &replay.routing_key,
        replay.payload,
    )
    .await
    .unwrap();
    h.pump().await;

    assert_eq!(h.store.offline_entries("carol").len(), 1);
    let unread = h.presence.unread_counts("carol").await.unwrap();
    assert_eq!(unread[0].count, 1);
    // Second push task is recorded as skipped
    let statuses: Vec<PushStatus> = h.store.push_log().into_iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![PushStatus::Success, PushStatus::Skipped]);
}

#[tokio::test]
async fn test_broker_outage_falls_back_to_direct_delivery() {
    let h = harness();
    let (mut alice, mut alice_rx) = h.login("alice").await;
    let (_bob, mut bob_rx) = h.login("bob").await;

    h.broker.fail_publishes(true);
    assert_eq!(alice.handle_text(&chat("bob", "direct")).await, Flow::Continue);

    assert_eq!(next(&mut alice_rx)["type"], "chat_response");
    let delivered = next(&mut bob_rx);
    assert_eq!(delivered["type"], "chat");
    assert_eq!(delivered["payload"]["content"], "direct");
    assert_eq!(h.store.message_count(), 0);
}
