//! Common types used across the chat gateway

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::GatewayError;

// =============================================================================
// Message Types
// =============================================================================

/// Content type of a chat message. Only text is accepted today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            other => Err(GatewayError::validation(format!(
                "unsupported message type: {other}"
            ))),
        }
    }
}

// =============================================================================
// Persisted Entities
// =============================================================================

/// A persisted chat message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: i64,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub message_type: String,
    pub content: String,
    pub extra: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Per-user view of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ConversationSummary {
    pub user_id: String,
    pub conversation_id: String,
    pub target_id: String,
    pub is_group: bool,
    pub last_message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_message_time: OffsetDateTime,
    pub unread_count: i32,
}

/// Durable record that a message awaits retrieval by an absent recipient.
/// `synced` moves false -> true exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OfflineIndexEntry {
    pub user_id: String,
    pub message_id: i64,
    pub conversation_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub synced: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub synced_at: Option<OffsetDateTime>,
}

/// An offline index entry joined with its message, as returned to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OfflineMessage {
    pub message_id: i64,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub extra: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One page of offline messages plus the unpaged total
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflinePage {
    pub messages: Vec<OfflineMessage>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

/// Pending offline messages for one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UnreadCount {
    pub conversation_id: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadSummary {
    pub total_unread: i64,
    pub unread_by_conversation: Vec<UnreadCount>,
}

impl UnreadSummary {
    pub fn from_counts(counts: Vec<UnreadCount>) -> Self {
        Self {
            total_unread: counts.iter().map(|c| c.count).sum(),
            unread_by_conversation: counts,
        }
    }
}

// =============================================================================
// Presence
// =============================================================================

/// Who owns a user's live connection. Absence of the record means offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub gateway_id: String,
    /// Connection that published this record; removal is guarded on it
    pub session_id: String,
    /// Unix seconds
    pub connected_at: i64,
    /// Unix seconds
    pub last_heartbeat: i64,
}

impl PresenceRecord {
    pub fn new(user_id: &str, gateway_id: &str, session_id: &str) -> Self {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        Self {
            user_id: user_id.to_string(),
            gateway_id: gateway_id.to_string(),
            session_id: session_id.to_string(),
            connected_at: now,
            last_heartbeat: now,
        }
    }
}

// =============================================================================
// Queue Payloads
// =============================================================================

/// Payload carried on `private.message` and `offline.message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    pub message_id: i64,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub message_type: String,
    pub content: String,
    #[serde(default)]
    pub extra: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ChatEnvelope {
    pub fn to_message(&self) -> Message {
        Message {
            id: self.message_id,
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            receiver_id: self.receiver_id.clone(),
            message_type: self.message_type.clone(),
            content: self.content.clone(),
            extra: self.extra.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Payload carried on `push.task`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushTask {
    pub user_id: String,
    pub message_id: i64,
    pub sender_id: String,
    pub content: String,
    pub conversation_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl From<&ChatEnvelope> for PushTask {
    fn from(env: &ChatEnvelope) -> Self {
        Self {
            user_id: env.receiver_id.clone(),
            message_id: env.message_id,
            sender_id: env.sender_id.clone(),
            content: env.content.clone(),
            conversation_id: env.conversation_id.clone(),
            timestamp: env.timestamp,
        }
    }
}

/// Outcome of an attempted push, stored in `push_log`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Success,
    Failed,
    Skipped,
}

impl PushStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushStatus::Success => "success",
            PushStatus::Failed => "failed",
            PushStatus::Skipped => "skipped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_parsing() {
        assert_eq!("text".parse::<MessageType>().unwrap(), MessageType::Text);
        let err = "image".parse::<MessageType>().unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn test_chat_envelope_wire_format() {
        let json = r#"{
            "message_id": 42,
            "conversation_id": "a_b",
            "sender_id": "a",
            "receiver_id": "b",
            "message_type": "text",
            "content": "hi",
            "timestamp": "2025-03-01T12:00:00Z"
        }"#;
        let env: ChatEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.message_id, 42);
        assert_eq!(env.extra, "");
        assert!(!env.is_group);

        let message = env.to_message();
        assert_eq!(message.id, 42);
        assert_eq!(message.receiver_id, "b");
    }

    #[test]
    fn test_push_task_targets_receiver() {
        let env = ChatEnvelope {
            message_id: 7,
            conversation_id: "a_b".into(),
            sender_id: "a".into(),
            receiver_id: "b".into(),
            message_type: "text".into(),
            content: "hello".into(),
            extra: String::new(),
            is_group: false,
            timestamp: OffsetDateTime::UNIX_EPOCH,
        };
        let task = PushTask::from(&env);
        assert_eq!(task.user_id, "b");
        assert_eq!(task.sender_id, "a");
    }

    #[test]
    fn test_unread_summary_totals() {
        let summary = UnreadSummary::from_counts(vec![
            UnreadCount { conversation_id: "a_b".into(), count: 3 },
            UnreadCount { conversation_id: "a_c".into(), count: 2 },
        ]);
        assert_eq!(summary.total_unread, 5);
    }

    #[test]
    fn test_offline_message_serializes_type_field() {
        let msg = OfflineMessage {
            message_id: 1,
            conversation_id: "a_b".into(),
            sender_id: "a".into(),
            content: "hi".into(),
            message_type: "text".into(),
            extra: String::new(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "text");
        assert!(json.get("message_type").is_none());
    }
}
