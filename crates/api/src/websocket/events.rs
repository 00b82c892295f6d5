//! Chat protocol frames
//!
//! Every frame is `{"type": ..., "payload": ...}`. Client frames are decoded in two
//! steps (envelope first, then the payload for the named type) so an unknown type and
//! a malformed payload produce distinct errors.

use chatgate_shared::{GatewayError, GatewayResult, OfflineMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

// =============================================================================
// Client-to-Server Frames
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginPayload {
    pub uid: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: String,
    #[serde(default)]
    pub extra: String,
    #[serde(default)]
    pub is_group: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct SyncRequest {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConfirmSynced {
    pub message_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FriendRequestPayload {
    pub to_uid: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupJoinPayload {
    pub group_id: i64,
    #[serde(default)]
    pub message: String,
}

/// Reply to a pending friend or group request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HandleRequestPayload {
    pub request_id: i64,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Login(LoginPayload),
    Chat(ChatPayload),
    SyncOfflineMessages(SyncRequest),
    ConfirmMessagesSynced(ConfirmSynced),
    FriendRequest(FriendRequestPayload),
    FriendRequestHandle(HandleRequestPayload),
    GroupJoinRequest(GroupJoinPayload),
    GroupJoinRequestHandle(HandleRequestPayload),
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> GatewayResult<T> {
    serde_json::from_value(value)
        .map_err(|e| GatewayError::validation(format!("invalid {kind} payload: {e}")))
}

impl ClientFrame {
    pub fn parse(text: &str) -> GatewayResult<Self> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|_| GatewayError::validation("invalid message format"))?;
        let kind = raw.kind.as_str();
        let value = raw.payload;

        Ok(match kind {
            "login" => ClientFrame::Login(payload(kind, value)?),
            "chat" => ClientFrame::Chat(payload(kind, value)?),
            "sync_offline_messages" => {
                // Payload is optional for this frame
                let request = if value.is_null() {
                    SyncRequest::default()
                } else {
                    payload(kind, value)?
                };
                ClientFrame::SyncOfflineMessages(request)
            }
            "confirm_messages_synced" => ClientFrame::ConfirmMessagesSynced(payload(kind, value)?),
            "friend_request" => ClientFrame::FriendRequest(payload(kind, value)?),
            "friend_request_handle" => ClientFrame::FriendRequestHandle(payload(kind, value)?),
            "group_join_request" => ClientFrame::GroupJoinRequest(payload(kind, value)?),
            "group_join_request_handle" => {
                ClientFrame::GroupJoinRequestHandle(payload(kind, value)?)
            }
            other => {
                return Err(GatewayError::validation(format!(
                    "unknown message type: {other}"
                )))
            }
        })
    }
}

// =============================================================================
// Server-to-Client Frames
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    LoginSuccess,
    Error { message: String },

    /// Acknowledgement to the sender
    ChatResponse(ChatDelivery),
    /// Delivery to the recipient
    Chat(ChatDelivery),

    OfflineMessages(OfflineBatch),
    ConfirmMessagesSyncedResponse { success: bool, count: u64 },

    FriendRequestResponse(RequestAck),
    FriendRequestReceived(FriendRequestNotice),
    FriendRequestHandleResponse(RequestAck),
    FriendRequestResult(FriendRequestResultNotice),
    GroupJoinRequestResponse(RequestAck),
    GroupJoinRequestReceived(GroupJoinNotice),
    GroupJoinRequestHandleResponse(RequestAck),
    GroupJoinRequestResult(GroupJoinResultNotice),
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }
}

// =============================================================================
// Frame Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatDelivery {
    pub success: bool,
    pub message: String,
    pub message_id: i64,
    pub from: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub extra: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub conversation: String,
    pub is_group: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OfflineBatch {
    pub messages: Vec<OfflineMessage>,
    pub count: usize,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestAck {
    pub success: bool,
    pub message: String,
}

impl RequestAck {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FriendRequestNotice {
    pub request_id: i64,
    pub from_uid: String,
    pub from_name: String,
    pub from_avatar: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct FriendRequestResultNotice {
    pub request_id: i64,
    pub from_uid: String,
    pub from_name: String,
    pub action: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupJoinNotice {
    pub request_id: i64,
    pub group_id: i64,
    pub group_name: String,
    pub from_uid: String,
    pub from_name: String,
    pub from_avatar: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupJoinResultNotice {
    pub request_id: i64,
    pub group_id: i64,
    pub group_name: String,
    pub handler_uid: String,
    pub handler_name: String,
    pub handler_role: String,
    pub action: String,
    pub message: String,
}
