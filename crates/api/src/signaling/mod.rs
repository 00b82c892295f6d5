//! Call-signaling relay
//!
//! Forwards offer/answer/ICE and call-control frames between peers connected to this
//! process and keeps every peer's roster current. Uses its own registry so a signaling
//! socket never displaces a chat socket for the same user.

pub mod events;
pub mod handler;

pub use events::{IceServer, SignalFrame};

use std::sync::Arc;

use crate::websocket::connection::Connection;
use crate::websocket::registry::ConnectionRegistry;

pub struct SignalingHub {
    registry: ConnectionRegistry,
    ice_servers: Vec<IceServer>,
}

impl SignalingHub {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            ice_servers,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    fn send(uid: &str, conn: &Connection, frame: &SignalFrame) {
        if let Err(e) = conn.send(frame) {
            tracing::warn!(user_id = %uid, frame_type = %frame.kind, error = %e, "Signaling send failed");
        }
    }

    async fn broadcast(&self, frame: &SignalFrame, except: Option<&str>) {
        for uid in self.registry.user_ids().await {
            if except == Some(uid.as_str()) {
                continue;
            }
            if let Some(conn) = self.registry.lookup(&uid).await {
                Self::send(&uid, &conn, frame);
            }
        }
    }

    async fn broadcast_roster(&self) {
        let roster = self.registry.user_ids().await;
        tracing::debug!(online = roster.len(), "Broadcasting signaling roster");
        self.broadcast(&SignalFrame::client_list(&roster), None).await;
    }

    /// Register a peer: evict any previous socket, send `registered` and the roster,
    /// then broadcast the updated roster to everyone.
    pub async fn join(&self, uid: &str, conn: Arc<Connection>) {
        if let Some(evicted) = self.registry.register(uid, conn.clone()).await {
            tracing::info!(user_id = %uid, session_id = %evicted.session_id, "Replacing signaling connection");
            evicted.close();
        }

        Self::send(uid, &conn, &SignalFrame::registered(uid, &self.ice_servers));
        let roster = self.registry.user_ids().await;
        Self::send(uid, &conn, &SignalFrame::client_list(&roster));
        self.broadcast_roster().await;
    }

    /// Unregister a peer if `conn` is still its socket, then tell the others
    pub async fn leave(&self, uid: &str, conn: &Arc<Connection>) {
        conn.close();
        if !self.registry.remove(uid, conn).await {
            return;
        }
        self.broadcast(&SignalFrame::user_offline(uid), Some(uid)).await;
        self.broadcast_roster().await;
    }

    /// Handle one inbound text frame from `uid`. Frames from a socket that no longer
    /// holds the peer's registry slot are dropped.
    pub async fn handle_text(&self, uid: &str, conn: &Connection, text: &str) {
        if !self.is_current(uid, conn).await {
            tracing::debug!(user_id = %uid, session_id = %conn.session_id, "Ignoring frame from superseded signaling socket");
            return;
        }
        let mut frame: SignalFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(user_id = %uid, error = %e, "Ignoring malformed signaling frame");
                return;
            }
        };
        frame.from = Some(uid.to_string());

        match frame.kind.as_str() {
            "register" => {
                tracing::debug!(user_id = %uid, "Ignoring register from registered peer");
            }
            "list-clients" => {
                let roster = self.registry.user_ids().await;
                Self::send(uid, conn, &SignalFrame::client_list(&roster));
            }
            _ if frame.is_relay() => self.relay(uid, frame).await,
            other => {
                tracing::debug!(user_id = %uid, frame_type = %other, "Unknown signaling frame type");
            }
        }
    }

    async fn is_current(&self, uid: &str, conn: &Connection) -> bool {
        !conn.is_closed()
            && self
                .registry
                .lookup(uid)
                .await
                .is_some_and(|registered| registered.session_id == conn.session_id)
    }

    async fn relay(&self, uid: &str, frame: SignalFrame) {
        let Some(to) = frame.to.clone().filter(|to| !to.is_empty()) else {
            tracing::debug!(user_id = %uid, frame_type = %frame.kind, "Relay frame without target dropped");
            return;
        };
        let Some(target) = self.registry.lookup(&to).await else {
            tracing::debug!(from = %uid, to = %to, frame_type = %frame.kind, "Relay target not connected");
            return;
        };
        Self::send(&to, &target, &frame);
        tracing::debug!(from = %uid, to = %to, frame_type = %frame.kind, "Signaling frame relayed");
    }
}
