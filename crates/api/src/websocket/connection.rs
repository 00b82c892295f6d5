//! WebSocket connection handle
//!
//! The handle a session registers and other tasks deliver through. Frames are
//! serialized by the caller's task and pushed into a bounded outbound buffer drained by
//! the connection's single writer task, so per-connection ordering holds and a slow
//! client never blocks the sender.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Why a frame could not be queued
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound buffer full")]
    Full,
    #[error("connection closed")]
    Closed,
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

/// An active WebSocket connection
#[derive(Debug)]
pub struct Connection {
    /// Unique id for this connection
    pub session_id: Uuid,

    /// Dropped on close, which ends the writer task
    outbound: Mutex<Option<mpsc::Sender<String>>>,

    shutdown: watch::Sender<bool>,
}

impl Connection {
    /// Create a connection and the receiving half its writer task drains
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (shutdown, _) = watch::channel(false);
        let conn = Self {
            session_id: Uuid::new_v4(),
            outbound: Mutex::new(Some(tx)),
            shutdown,
        };
        (conn, rx)
    }

    /// Queue a frame without waiting
    pub fn send<T: Serialize>(&self, frame: &T) -> Result<(), SendError> {
        let text = serde_json::to_string(frame).map_err(|e| SendError::Encode(e.to_string()))?;
        self.send_text(text)
    }

    /// Queue an already-serialized frame without waiting
    pub fn send_text(&self, text: String) -> Result<(), SendError> {
        let guard = self.outbound.lock().map_err(|_| SendError::Closed)?;
        let sender = guard.as_ref().ok_or(SendError::Closed)?;
        sender.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Stop accepting frames and signal the reader to stop.
    /// Frames already buffered are still written. Idempotent.
    pub fn close(&self) {
        let sender = self.outbound.lock().ok().and_then(|mut guard| guard.take());
        if sender.is_some() {
            tracing::debug!(session_id = %self.session_id, "Connection closed");
        }
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`Connection::close`] has been called
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
