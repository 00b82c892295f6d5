//! In-memory stores for tests
//!
//! Mirrors the Postgres semantics: idempotent message inserts, all-or-nothing summary
//! updates, unique `(user_id, message_id)` offline entries.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chatgate_shared::{
    ConversationSummary, GatewayError, GatewayResult, Message, OfflineIndexEntry, OfflineMessage,
    OfflinePage, PageRequest, PushStatus, PushTask, UnreadCount, UnreadSummary,
};
use time::OffsetDateTime;

use super::{purge_cutoff, MessageStore, OfflineStore, PersistOutcome, PushLog, SyncedBatch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushLogRow {
    pub user_id: String,
    pub message_id: i64,
    pub channel: String,
    pub status: PushStatus,
    pub error: Option<String>,
}

#[derive(Default)]
struct Tables {
    messages: BTreeMap<i64, Message>,
    summaries: HashMap<(String, String), ConversationSummary>,
    offline: Vec<OfflineIndexEntry>,
    push_log: Vec<PushLogRow>,
    fail_writes: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

fn poisoned<T>(_: T) -> GatewayError {
    GatewayError::fatal("store lock poisoned")
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a transient error
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.fail_writes = fail;
        }
    }

    pub fn message_count(&self) -> usize {
        self.tables.lock().map(|t| t.messages.len()).unwrap_or(0)
    }

    pub fn offline_entries(&self, user_id: &str) -> Vec<OfflineIndexEntry> {
        self.tables
            .lock()
            .map(|t| {
                t.offline
                    .iter()
                    .filter(|e| e.user_id == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn push_log(&self) -> Vec<PushLogRow> {
        self.tables
            .lock()
            .map(|t| t.push_log.clone())
            .unwrap_or_default()
    }

    /// Test hook: insert an offline entry with an explicit creation time
    pub fn insert_offline_entry(&self, entry: OfflineIndexEntry) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.offline.push(entry);
        }
    }

    /// Test hook: insert a message row without touching summaries
    pub fn insert_message(&self, message: Message) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.messages.insert(message.id, message);
        }
    }
}

fn apply_summary(
    summaries: &mut HashMap<(String, String), ConversationSummary>,
    user_id: &str,
    target_id: &str,
    message: &Message,
    unread_increment: i32,
) {
    let key = (user_id.to_string(), message.conversation_id.clone());
    let summary = summaries.entry(key).or_insert_with(|| ConversationSummary {
        user_id: user_id.to_string(),
        conversation_id: message.conversation_id.clone(),
        target_id: target_id.to_string(),
        is_group: false,
        last_message: String::new(),
        last_message_time: message.timestamp,
        unread_count: 0,
    });
    summary.last_message = message.content.clone();
    summary.last_message_time = message.timestamp;
    summary.unread_count += unread_increment;
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn persist(&self, message: &Message) -> GatewayResult<PersistOutcome> {
        let mut tables = self.tables.lock().map_err(poisoned)?;
        if tables.fail_writes {
            return Err(GatewayError::transient("database unavailable"));
        }
        if tables.messages.contains_key(&message.id) {
            return Ok(PersistOutcome::Duplicate);
        }
        tables.messages.insert(message.id, message.clone());
        apply_summary(&mut tables.summaries, &message.sender_id, &message.receiver_id, message, 0);
        apply_summary(&mut tables.summaries, &message.receiver_id, &message.sender_id, message, 1);
        Ok(PersistOutcome::Inserted)
    }

    async fn summary(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> GatewayResult<Option<ConversationSummary>> {
        let tables = self.tables.lock().map_err(poisoned)?;
        Ok(tables
            .summaries
            .get(&(user_id.to_string(), conversation_id.to_string()))
            .cloned())
    }

    async fn ping(&self) -> GatewayResult<()> {
        Ok(())
    }
}

#[async_trait]
impl OfflineStore for MemoryStore {
    async fn upsert_entry(
        &self,
        user_id: &str,
        message_id: i64,
        conversation_id: &str,
    ) -> GatewayResult<bool> {
        let mut tables = self.tables.lock().map_err(poisoned)?;
        if tables.fail_writes {
            return Err(GatewayError::transient("database unavailable"));
        }
        if tables
            .offline
            .iter()
            .any(|e| e.user_id == user_id && e.message_id == message_id)
        {
            return Ok(false);
        }
        tables.offline.push(OfflineIndexEntry {
            user_id: user_id.to_string(),
            message_id,
            conversation_id: conversation_id.to_string(),
            created_at: OffsetDateTime::now_utc(),
            synced: false,
            synced_at: None,
        });
        Ok(true)
    }

    async fn entry(&self, user_id: &str, message_id: i64) -> GatewayResult<Option<OfflineIndexEntry>> {
        let tables = self.tables.lock().map_err(poisoned)?;
        Ok(tables
            .offline
            .iter()
            .find(|e| e.user_id == user_id && e.message_id == message_id)
            .cloned())
    }

    async fn list(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        page: PageRequest,
    ) -> GatewayResult<OfflinePage> {
        let tables = self.tables.lock().map_err(poisoned)?;
        let mut pending: Vec<(&OfflineIndexEntry, &Message)> = tables
            .offline
            .iter()
            .filter(|e| e.user_id == user_id && !e.synced)
            .filter(|e| conversation_id.map_or(true, |c| e.conversation_id == c))
            .filter_map(|e| tables.messages.get(&e.message_id).map(|m| (e, m)))
            .collect();
        pending.sort_by(|(a, _), (b, _)| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.message_id.cmp(&a.message_id))
        });

        let total = pending.len() as i64;
        let messages = pending
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .map(|(entry, message)| OfflineMessage {
                message_id: entry.message_id,
                conversation_id: entry.conversation_id.clone(),
                sender_id: message.sender_id.clone(),
                content: message.content.clone(),
                message_type: message.message_type.clone(),
                extra: message.extra.clone(),
                timestamp: message.timestamp,
                created_at: entry.created_at,
            })
            .collect();

        Ok(OfflinePage {
            messages,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn mark_synced(&self, user_id: &str, message_ids: &[i64]) -> GatewayResult<SyncedBatch> {
        let mut tables = self.tables.lock().map_err(poisoned)?;
        let now = OffsetDateTime::now_utc();
        let mut batch = SyncedBatch::default();
        for entry in tables
            .offline
            .iter_mut()
            .filter(|e| e.user_id == user_id && !e.synced && message_ids.contains(&e.message_id))
        {
            entry.synced = true;
            entry.synced_at = Some(now);
            batch.count += 1;
            batch.conversation_ids.push(entry.conversation_id.clone());
        }
        batch.conversation_ids.sort();
        batch.conversation_ids.dedup();
        Ok(batch)
    }

    async fn unread_counts(&self, user_id: &str) -> GatewayResult<UnreadSummary> {
        let tables = self.tables.lock().map_err(poisoned)?;
        let mut grouped: BTreeMap<String, i64> = BTreeMap::new();
        for entry in tables.offline.iter().filter(|e| e.user_id == user_id && !e.synced) {
            *grouped.entry(entry.conversation_id.clone()).or_default() += 1;
        }
        Ok(UnreadSummary::from_counts(
            grouped
                .into_iter()
                .map(|(conversation_id, count)| UnreadCount {
                    conversation_id,
                    count,
                })
                .collect(),
        ))
    }

    async fn purge(&self, user_id: &str, older_than_days: i64) -> GatewayResult<u64> {
        let mut tables = self.tables.lock().map_err(poisoned)?;
        let cutoff = purge_cutoff(OffsetDateTime::now_utc(), older_than_days)?;
        let before = tables.offline.len();
        tables.offline.retain(|e| {
            !(e.user_id == user_id && e.synced && e.synced_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - tables.offline.len()) as u64)
    }
}

#[async_trait]
impl PushLog for MemoryStore {
    async fn already_pushed(&self, user_id: &str, message_id: i64) -> GatewayResult<bool> {
        let tables = self.tables.lock().map_err(poisoned)?;
        Ok(tables.push_log.iter().any(|row| {
            row.user_id == user_id && row.message_id == message_id && row.status == PushStatus::Success
        }))
    }

    async fn record_push(
        &self,
        task: &PushTask,
        channel: &str,
        status: PushStatus,
        error: Option<&str>,
    ) -> GatewayResult<()> {
        let mut tables = self.tables.lock().map_err(poisoned)?;
        if tables.fail_writes {
            return Err(GatewayError::transient("database unavailable"));
        }
        tables.push_log.push(PushLogRow {
            user_id: task.user_id.clone(),
            message_id: task.message_id,
            channel: channel.to_string(),
            status,
            error: error.map(str::to_string),
        });
        Ok(())
    }
}
