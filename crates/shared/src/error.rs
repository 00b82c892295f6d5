//! Error taxonomy for the chat gateway
//!
//! Every fallible path in the gateway, the consumers, and the stores reports one of
//! these kinds. Gateway sessions turn them into `error` frames; queue consumers turn
//! them into ack / requeue / stop decisions.

use std::fmt::Display;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed frame or missing field
    #[error("{0}")]
    Validation(String),

    /// Bad credential or identity mismatch
    #[error("{0}")]
    Auth(String),

    /// Duplicate request or already-processed state
    #[error("{0}")]
    Conflict(String),

    /// Unknown target, recipient, or room
    #[error("{0}")]
    NotFound(String),

    /// Store, queue, or cache unavailable
    #[error("Infrastructure unavailable: {0}")]
    Transient(String),

    /// Unrecoverable local state corruption
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Wrap any infrastructure error as transient
    pub fn transient(err: impl Display) -> Self {
        Self::Transient(err.to_string())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether a queue consumer should requeue the envelope that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Message safe to show to an end user.
    /// Infrastructure details are logged, never sent over the wire.
    pub fn client_message(&self) -> String {
        match self {
            Self::Transient(_) | Self::Fatal(_) => "service temporarily unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => GatewayError::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // PostgreSQL unique violation
                if db_err.code().as_deref() == Some("23505") {
                    return GatewayError::Conflict("Resource already exists".to_string());
                }
                GatewayError::Transient(db_err.to_string())
            }
            other => GatewayError::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Validation(format!("Invalid payload: {err}"))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
