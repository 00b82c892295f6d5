//! Message, offline-index, and push-log storage

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chatgate_shared::{
    ConversationSummary, GatewayError, GatewayResult, Message, OfflineIndexEntry, OfflinePage, PageRequest,
    PushStatus, PushTask, UnreadSummary,
};
use time::{Duration, OffsetDateTime};

/// Longest purge window accepted from callers
pub const MAX_RETENTION_DAYS: i64 = 3650;

/// Cutoff for a purge window of `days`, bounded to `1..=MAX_RETENTION_DAYS`
pub(crate) fn purge_cutoff(now: OffsetDateTime, days: i64) -> GatewayResult<OffsetDateTime> {
    if !(1..=MAX_RETENTION_DAYS).contains(&days) {
        return Err(GatewayError::validation(format!(
            "days must be between 1 and {MAX_RETENTION_DAYS}"
        )));
    }
    now.checked_sub(Duration::days(days))
        .ok_or_else(|| GatewayError::validation("purge window out of range"))
}

/// Result of persisting one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted,
    /// A message with this id already exists; nothing was written
    Duplicate,
}

/// Result of a mark-synced call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncedBatch {
    /// Entries that moved from unsynced to synced
    pub count: u64,
    /// Distinct conversations those entries belong to
    pub conversation_ids: Vec<String>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert `message` and update the sender's and receiver's conversation summaries
    /// as one unit. Idempotent on `message.id`.
    async fn persist(&self, message: &Message) -> GatewayResult<PersistOutcome>;

    async fn summary(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> GatewayResult<Option<ConversationSummary>>;

    /// Round-trip check for the health endpoints
    async fn ping(&self) -> GatewayResult<()>;
}

#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Create the index entry for `(user_id, message_id)` if it does not exist.
    /// Returns whether a new entry was created.
    async fn upsert_entry(
        &self,
        user_id: &str,
        message_id: i64,
        conversation_id: &str,
    ) -> GatewayResult<bool>;

    async fn entry(&self, user_id: &str, message_id: i64) -> GatewayResult<Option<OfflineIndexEntry>>;

    /// Unsynced entries joined with their messages, newest first
    async fn list(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        page: PageRequest,
    ) -> GatewayResult<OfflinePage>;

    /// Mark unsynced entries as synced. Already-synced ids match nothing.
    async fn mark_synced(&self, user_id: &str, message_ids: &[i64]) -> GatewayResult<SyncedBatch>;

    /// Authoritative unread counts from the unsynced index
    async fn unread_counts(&self, user_id: &str) -> GatewayResult<UnreadSummary>;

    /// Delete synced entries whose `synced_at` is older than `older_than_days`.
    /// Windows outside `1..=MAX_RETENTION_DAYS` are a validation error.
    async fn purge(&self, user_id: &str, older_than_days: i64) -> GatewayResult<u64>;
}

#[async_trait]
pub trait PushLog: Send + Sync {
    /// Whether a successful push for this message was already recorded
    async fn already_pushed(&self, user_id: &str, message_id: i64) -> GatewayResult<bool>;

    async fn record_push(
        &self,
        task: &PushTask,
        channel: &str,
        status: PushStatus,
        error: Option<&str>,
    ) -> GatewayResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purge_cutoff_bounds() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(purge_cutoff(now, 7).unwrap(), now - Duration::days(7));
        assert!(purge_cutoff(now, MAX_RETENTION_DAYS).is_ok());
        assert!(purge_cutoff(now, MAX_RETENTION_DAYS + 1).is_err());
        assert!(purge_cutoff(now, 0).is_err());
        assert!(purge_cutoff(now, i64::MIN).is_err());
    }
}
