//! Presence store
//!
//! Records which gateway owns a user's live connection, plus a per-conversation
//! unread counter cache. The cache is advisory: authoritative unread counts come from
//! the offline index.

mod memory;
mod redis_store;

pub use memory::MemoryPresence;
pub use redis_store::{presence_ttl, RedisPresence};

use async_trait::async_trait;
use chatgate_shared::{GatewayResult, PresenceRecord, UnreadCount};

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Publish (or overwrite) the presence record for `record.user_id`
    async fn set_online(&self, record: &PresenceRecord) -> GatewayResult<()>;

    async fn get(&self, user_id: &str) -> GatewayResult<Option<PresenceRecord>>;

    async fn is_online(&self, user_id: &str) -> GatewayResult<bool> {
        Ok(self.get(user_id).await?.is_some())
    }

    /// Refresh `last_heartbeat`. No-op when the user is offline.
    async fn heartbeat(&self, user_id: &str) -> GatewayResult<()>;

    /// Delete the record only if it still belongs to `session_id`.
    /// Returns whether a record was removed.
    async fn set_offline(&self, user_id: &str, session_id: &str) -> GatewayResult<bool>;

    async fn incr_unread(&self, user_id: &str, conversation_id: &str) -> GatewayResult<i64>;

    async fn clear_unread(&self, user_id: &str, conversation_id: &str) -> GatewayResult<()>;

    async fn unread_counts(&self, user_id: &str) -> GatewayResult<Vec<UnreadCount>>;

    /// Round-trip check for the health endpoints
    async fn ping(&self) -> GatewayResult<()>;
}

pub(crate) fn online_key(user_id: &str) -> String {
    format!("online:user:{user_id}")
}

pub(crate) fn unread_key(user_id: &str) -> String {
    format!("unread:{user_id}")
}
