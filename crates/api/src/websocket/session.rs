//! Chat session state machine
//!
//! Transport independent: the handler feeds it text frames and heartbeats, and it
//! answers through the connection's outbound buffer.
//!
//! `Connecting -> Authenticating -> Authenticated -> Closed`. Any failure before login
//! completes ends the session; after login, failures become `error` frames.

use std::sync::Arc;

use chatgate_shared::{GatewayError, GatewayResult, PageRequest, PresenceRecord};

use super::connection::Connection;
use super::events::{ClientFrame, ConfirmSynced, LoginPayload, OfflineBatch, ServerFrame, SyncRequest};
use super::state::ChatGateway;

pub const LOGIN_REQUIRED: &str = "please log in first";
pub const LOGIN_TIMED_OUT: &str = "login timed out";
pub const LOGGED_IN_ELSEWHERE: &str = "account logged in elsewhere";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Authenticated { user_id: String },
    Closed,
}

/// Whether the reader should keep going after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Session {
    gateway: Arc<ChatGateway>,
    conn: Arc<Connection>,
    state: SessionState,
}

impl Session {
    pub fn new(gateway: Arc<ChatGateway>, conn: Arc<Connection>) -> Self {
        Self {
            gateway,
            conn,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn user_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Authenticated { user_id } => Some(user_id),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id().is_some()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// The transport is up; the login deadline starts now
    pub fn begin_handshake(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Authenticating;
        }
    }

    fn send_error(&self, message: &str) {
        if let Err(e) = self.conn.send(&ServerFrame::error(message)) {
            tracing::debug!(session_id = %self.conn.session_id, error = %e, "Could not queue error frame");
        }
    }

    pub async fn handle_text(&mut self, text: &str) -> Flow {
        if self.state == SessionState::Closed {
            return Flow::Close;
        }
        let Some(user_id) = self.user_id().map(str::to_string) else {
            return self.handle_unauthenticated(text).await;
        };

        if let Err(e) = self.dispatch(&user_id, text).await {
            match &e {
                GatewayError::Transient(_) | GatewayError::Fatal(_) => tracing::error!(
                    user_id = %user_id,
                    session_id = %self.conn.session_id,
                    error = %e,
                    "Frame handling failed"
                ),
                _ => tracing::debug!(
                    user_id = %user_id,
                    session_id = %self.conn.session_id,
                    error = %e,
                    "Frame rejected"
                ),
            }
            self.send_error(&e.client_message());
        }
        Flow::Continue
    }

    async fn handle_unauthenticated(&mut self, text: &str) -> Flow {
        self.begin_handshake();

        let login = match ClientFrame::parse(text) {
            Ok(ClientFrame::Login(login)) => login,
            Ok(_) => {
                self.send_error(LOGIN_REQUIRED);
                return Flow::Close;
            }
            Err(e) => {
                self.send_error(&e.client_message());
                return Flow::Close;
            }
        };

        match self.login(login).await {
            Ok(user_id) => {
                tracing::info!(
                    user_id = %user_id,
                    session_id = %self.conn.session_id,
                    gateway_id = %self.gateway.gateway_id,
                    "User logged in"
                );
                self.state = SessionState::Authenticated { user_id };
                if let Err(e) = self.conn.send(&ServerFrame::LoginSuccess) {
                    tracing::warn!(session_id = %self.conn.session_id, error = %e, "Could not queue login_success");
                }
                Flow::Continue
            }
            Err(e) => {
                tracing::info!(session_id = %self.conn.session_id, error = %e, "Login rejected");
                self.send_error(&e.client_message());
                Flow::Close
            }
        }
    }

    async fn login(&self, login: LoginPayload) -> GatewayResult<String> {
        if login.uid.is_empty() || login.token.is_empty() {
            return Err(GatewayError::validation("uid and token are required"));
        }

        let user_id = self.gateway.verifier.verify(&login.token)?;
        if user_id != login.uid {
            return Err(GatewayError::auth("authentication failed"));
        }

        // Presence and registry must end up naming the same session
        let _login = self.gateway.registry.login_lock(&user_id).await?;

        let record = PresenceRecord::new(
            &user_id,
            &self.gateway.gateway_id,
            &self.conn.session_id.to_string(),
        );
        self.gateway.presence.set_online(&record).await?;

        if let Some(evicted) = self.gateway.registry.register(&user_id, self.conn.clone()).await {
            if !Arc::ptr_eq(&evicted, &self.conn) {
                tracing::info!(
                    user_id = %user_id,
                    evicted_session = %evicted.session_id,
                    "Closing previous session"
                );
                if let Err(e) = evicted.send(&ServerFrame::error(LOGGED_IN_ELSEWHERE)) {
                    tracing::debug!(
                        user_id = %user_id,
                        evicted_session = %evicted.session_id,
                        error = %e,
                        "Could not notify evicted session"
                    );
                }
                evicted.close();
            }
        }

        Ok(user_id)
    }

    async fn dispatch(&self, user_id: &str, text: &str) -> GatewayResult<()> {
        let social = &self.gateway.social;
        match ClientFrame::parse(text)? {
            ClientFrame::Login(_) => Err(GatewayError::conflict("already logged in")),
            ClientFrame::Chat(payload) => self
                .gateway
                .ingestor
                .ingest(user_id, &self.conn, payload)
                .await
                .map(|_| ()),
            ClientFrame::SyncOfflineMessages(request) => self.sync_offline(user_id, request).await,
            ClientFrame::ConfirmMessagesSynced(confirm) => self.confirm_synced(user_id, confirm).await,
            ClientFrame::FriendRequest(payload) => {
                social.friend_request(user_id, &self.conn, payload).await
            }
            ClientFrame::FriendRequestHandle(payload) => {
                social.handle_friend_request(user_id, &self.conn, payload).await
            }
            ClientFrame::GroupJoinRequest(payload) => {
                social.group_join_request(user_id, &self.conn, payload).await
            }
            ClientFrame::GroupJoinRequestHandle(payload) => {
                social.handle_group_join_request(user_id, &self.conn, payload).await
            }
        }
    }

    async fn sync_offline(&self, user_id: &str, request: SyncRequest) -> GatewayResult<()> {
        let page = PageRequest::normalize(request.page, request.page_size);
        let result = self.gateway.offline.list(user_id, None, page).await?;

        tracing::debug!(
            user_id = %user_id,
            page = result.page,
            returned = result.messages.len(),
            total = result.total,
            "Offline messages synced"
        );

        let batch = OfflineBatch {
            count: result.messages.len(),
            messages: result.messages,
            page: result.page,
            page_size: result.page_size,
            total: result.total,
        };
        self.conn
            .send(&ServerFrame::OfflineMessages(batch))
            .map_err(GatewayError::transient)
    }

    async fn confirm_synced(&self, user_id: &str, confirm: ConfirmSynced) -> GatewayResult<()> {
        if confirm.message_ids.is_empty() {
            return Err(GatewayError::validation("message_ids is required"));
        }

        let batch = self
            .gateway
            .offline
            .mark_synced(user_id, &confirm.message_ids)
            .await?;

        for conversation_id in &batch.conversation_ids {
            if let Err(e) = self.gateway.presence.clear_unread(user_id, conversation_id).await {
                tracing::warn!(
                    user_id = %user_id,
                    conversation_id = %conversation_id,
                    error = %e,
                    "Failed to clear unread counter"
                );
            }
        }

        tracing::debug!(user_id = %user_id, count = batch.count, "Offline messages confirmed");
        self.conn
            .send(&ServerFrame::ConfirmMessagesSyncedResponse {
                success: true,
                count: batch.count,
            })
            .map_err(GatewayError::transient)
    }

    /// Inbound ping or pong
    pub async fn on_heartbeat(&self) {
        let Some(user_id) = self.user_id() else {
            return;
        };
        if let Err(e) = self.gateway.presence.heartbeat(user_id).await {
            tracing::warn!(user_id = %user_id, error = %e, "Presence heartbeat failed");
        }
    }

    /// The login deadline passed
    pub fn handshake_timed_out(&self) {
        tracing::info!(session_id = %self.conn.session_id, "Login deadline exceeded");
        self.send_error(LOGIN_TIMED_OUT);
    }

    /// Tear down. Registry and presence entries are only removed while they still
    /// belong to this session. Idempotent.
    pub async fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        self.conn.close();

        let SessionState::Authenticated { user_id } = previous else {
            return;
        };

        if !self.gateway.registry.remove(&user_id, &self.conn).await {
            tracing::debug!(user_id = %user_id, session_id = %self.conn.session_id, "Session was superseded");
            return;
        }

        let session_id = self.conn.session_id.to_string();
        match self.gateway.presence.set_offline(&user_id, &session_id).await {
            Ok(removed) => {
                tracing::info!(user_id = %user_id, session_id = %session_id, presence_removed = removed, "User went offline");
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to clear presence");
            }
        }
    }
}
