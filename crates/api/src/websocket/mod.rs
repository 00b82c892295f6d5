//! Chat WebSocket gateway
//!
//! - **Connection**: handle other tasks deliver frames through
//! - **Registry**: user id to live connection, one per user
//! - **Session**: login and frame handling state machine
//! - **Handler**: Axum upgrade route and socket loops
//! - **Events**: client and server frame definitions

pub mod connection;
pub mod events;
pub mod handler;
pub mod registry;
pub mod session;
pub mod state;

pub use connection::Connection;
pub use handler::ws_handler;
pub use registry::ConnectionRegistry;
pub use session::{Flow, Session, SessionState};
pub use state::{ChatGateway, SessionSettings};
