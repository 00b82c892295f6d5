//! WebSocket handler for Axum
//!
//! One writer task per connection drains the outbound buffer and sends pings; the
//! upgrade task reads frames and drives the [`Session`].

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};

use crate::state::AppState;

use super::{
    connection::Connection,
    session::{Flow, Session},
    state::ChatGateway,
};

/// `GET /ws`. Authentication happens in-band with the `login` frame.
pub async fn ws_handler(ws: WebSocketUpgrade, State(app_state): State<AppState>) -> Response {
    let gateway = app_state.gateway.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<ChatGateway>) {
    let settings = gateway.settings;
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

    tracing::debug!(session_id = %conn.session_id, "WebSocket connection opened");

    let mut session = Session::new(gateway, conn.clone());
    session.begin_handshake();
    read_loop(&mut session, stream, settings.handshake_timeout, settings.read_timeout).await;
    session.close().await;

    if let Err(e) = writer.await {
        tracing::warn!(session_id = %conn.session_id, error = ?e, "Writer task failed");
    }
    tracing::debug!(session_id = %conn.session_id, "WebSocket connection finished");
}

async fn read_loop(
    session: &mut Session,
    mut stream: SplitStream<WebSocket>,
    handshake_timeout: Duration,
    read_timeout: Duration,
) {
    let handshake_deadline = Instant::now() + handshake_timeout;
    let mut closed = session.connection().closed_signal();

    loop {
        if session.connection().is_closed() {
            break;
        }
        let deadline = if session.is_authenticated() {
            Instant::now() + read_timeout
        } else {
            handshake_deadline
        };

        let next = tokio::select! {
            _ = closed.changed() => break,
            next = timeout_at(deadline, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                if session.is_authenticated() {
                    tracing::info!(
                        user_id = session.user_id().unwrap_or_default(),
                        "Read deadline exceeded"
                    );
                } else {
                    session.handshake_timed_out();
                }
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(error = %e, "WebSocket read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if session.handle_text(&text).await == Flow::Close {
                    break;
                }
            }
            Message::Ping(_) | Message::Pong(_) => session.on_heartbeat().await,
            Message::Close(_) => {
                tracing::debug!(session_id = %session.connection().session_id, "Close frame received");
                break;
            }
            Message::Binary(_) => {
                tracing::debug!(session_id = %session.connection().session_id, "Ignoring binary frame");
            }
        }
    }
}

async fn send_with_timeout(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    write_timeout: Duration,
) -> bool {
    matches!(timeout(write_timeout, sink.send(message)).await, Ok(Ok(())))
}

/// Drain `rx` into the socket and ping every `ping_interval`. When the buffer's sender
/// is dropped, whatever is still buffered is written, then a close frame. A failed or
/// slow write closes the connection.
pub(crate) async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    conn: Arc<Connection>,
    ping_interval: Duration,
    write_timeout: Duration,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(text) => {
                    if !send_with_timeout(&mut sink, Message::Text(text), write_timeout).await {
                        tracing::debug!(session_id = %conn.session_id, "Write failed");
                        break;
                    }
                }
                None => {
                    let _ = send_with_timeout(&mut sink, Message::Close(None), write_timeout).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if !send_with_timeout(&mut sink, Message::Ping(Vec::new()), write_timeout).await {
                    tracing::debug!(session_id = %conn.session_id, "Ping failed");
                    break;
                }
            }
        }
    }

    conn.close();
    let _ = sink.close().await;
}
