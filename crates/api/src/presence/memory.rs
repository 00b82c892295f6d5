//! In-process presence store for tests and single-node development

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chatgate_shared::{GatewayError, GatewayResult, PresenceRecord, UnreadCount};
use time::OffsetDateTime;

use super::PresenceStore;

#[derive(Debug, Default)]
pub struct MemoryPresence {
    online: Mutex<HashMap<String, PresenceRecord>>,
    unread: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> GatewayError {
    GatewayError::fatal("presence lock poisoned")
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn set_online(&self, record: &PresenceRecord) -> GatewayResult<()> {
        self.online
            .lock()
            .map_err(poisoned)?
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, user_id: &str) -> GatewayResult<Option<PresenceRecord>> {
        Ok(self.online.lock().map_err(poisoned)?.get(user_id).cloned())
    }

    async fn heartbeat(&self, user_id: &str) -> GatewayResult<()> {
        if let Some(record) = self.online.lock().map_err(poisoned)?.get_mut(user_id) {
            record.last_heartbeat = OffsetDateTime::now_utc().unix_timestamp();
        }
        Ok(())
    }

    async fn set_offline(&self, user_id: &str, session_id: &str) -> GatewayResult<bool> {
        let mut online = self.online.lock().map_err(poisoned)?;
        match online.get(user_id) {
            Some(record) if record.session_id == session_id => {
                online.remove(user_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr_unread(&self, user_id: &str, conversation_id: &str) -> GatewayResult<i64> {
        let mut unread = self.unread.lock().map_err(poisoned)?;
        let count = unread
            .entry(user_id.to_string())
            .or_default()
            .entry(conversation_id.to_string())
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn clear_unread(&self, user_id: &str, conversation_id: &str) -> GatewayResult<()> {
        if let Some(per_user) = self.unread.lock().map_err(poisoned)?.get_mut(user_id) {
            per_user.remove(conversation_id);
        }
        Ok(())
    }

    async fn unread_counts(&self, user_id: &str) -> GatewayResult<Vec<UnreadCount>> {
        let unread = self.unread.lock().map_err(poisoned)?;
        let mut counts: Vec<UnreadCount> = unread
            .get(user_id)
            .map(|per_user| {
                per_user
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(|(conversation_id, count)| UnreadCount {
                        conversation_id: conversation_id.clone(),
                        count: *count,
                    })
                    .collect()
            })
            .unwrap_or_default();
        counts.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        Ok(counts)
    }

    async fn ping(&self) -> GatewayResult<()> {
        Ok(())
    }
}
