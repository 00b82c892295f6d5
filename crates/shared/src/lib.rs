//! NetherLink Chat Gateway Shared Types and Utilities
//!
//! This crate contains the domain types, identifiers, errors, and database helpers
//! shared by the gateway process and the queue worker.

pub mod db;
pub mod error;
pub mod ids;
pub mod pagination;
pub mod types;

pub use db::*;
pub use error::*;
pub use ids::{conversation_id, MessageIdGenerator};
pub use pagination::PageRequest;
pub use types::*;
