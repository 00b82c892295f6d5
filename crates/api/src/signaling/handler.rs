//! `GET /ws/webrtc?uid=&token=`
//!
//! Signaling peers authenticate on the upgrade request rather than in-band.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{stream::SplitStream, StreamExt};
use serde::Deserialize;
use tokio::time::timeout;

use crate::error::ApiError;
use crate::state::AppState;
use crate::websocket::handler::write_loop;
use crate::websocket::{Connection, SessionSettings};

use super::SignalingHub;

#[derive(Debug, Deserialize)]
pub struct SignalingQuery {
    #[serde(default)]
    uid: String,
    #[serde(default)]
    token: Option<String>,
}

pub async fn signaling_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Query(params): Query<SignalingQuery>,
) -> Result<Response, ApiError> {
    if params.uid.is_empty() {
        return Err(ApiError::Validation("uid is required".to_string()));
    }

    if app_state.config.signaling_require_token {
        let token = params.token.as_deref().ok_or(ApiError::Unauthorized)?;
        let verified = app_state
            .verifier
            .verify(token)
            .map_err(|_| ApiError::InvalidToken)?;
        if verified != params.uid {
            tracing::warn!(uid = %params.uid, "Signaling token issued for another user");
            return Err(ApiError::InvalidToken);
        }
    }

    let hub = app_state.signaling.clone();
    let settings = app_state.gateway.settings;
    let uid = params.uid;
    tracing::info!(user_id = %uid, "Signaling connection upgrade requested");

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, uid, hub, settings)))
}

async fn handle_socket(socket: WebSocket, uid: String, hub: Arc<SignalingHub>, settings: SessionSettings) {
    let (sink, stream) = socket.split();
    let (conn, rx) = Connection::new(settings.outbound_buffer);
    let conn = Arc::new(conn);
    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        conn.clone(),
        settings.ping_interval,
        settings.write_timeout,
    ));

    hub.join(&uid, conn.clone()).await;
    read_loop(&hub, &uid, &conn, stream, settings.read_timeout).await;
    hub.leave(&uid, &conn).await;

    if let Err(e) = writer.await {
        tracing::warn!(user_id = %uid, error = ?e, "Signaling writer task failed");
    }
    tracing::info!(user_id = %uid, "Signaling connection closed");
}

async fn read_loop(
    hub: &SignalingHub,
    uid: &str,
    conn: &Arc<Connection>,
    mut stream: SplitStream<WebSocket>,
    read_timeout: Duration,
) {
    let mut closed = conn.closed_signal();

    loop {
        if conn.is_closed() {
            break;
        }
        let next = tokio::select! {
            _ = closed.changed() => break,
            next = timeout(read_timeout, stream.next()) => next,
        };

        match next {
            Err(_) => {
                tracing::info!(user_id = %uid, "Signaling read deadline exceeded");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(user_id = %uid, error = %e, "Signaling read failed");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => hub.handle_text(uid, conn, &text).await,
            Ok(Some(Ok(_))) => {}
        }
    }
}
