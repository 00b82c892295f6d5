//! NetherLink chat gateway
//!
//! Real-time delivery backbone: the chat WebSocket gateway, the call-signaling relay,
//! the queue-driven message pipeline, and the offline sync API.

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod presence;
pub mod queue;
pub mod routes;
pub mod signaling;
pub mod social;
pub mod state;
pub mod store;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::{AppState, Infrastructure};
