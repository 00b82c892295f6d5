//! Message pipeline
//!
//! ingest (gateway) -> `private.message` -> persistence -> `offline.message` ->
//! dispatch (gateway) -> live connection, or offline index + `push.task` -> push.

pub mod dispatch;
pub mod ingest;
pub mod persistence;
pub mod push;

pub use dispatch::DispatchConsumer;
pub use ingest::Ingestor;
pub use persistence::PersistenceConsumer;
pub use push::{LogNotifier, PushConsumer, PushNotifier, WebhookNotifier};

use chatgate_shared::ChatEnvelope;

use crate::websocket::events::ChatDelivery;

/// Text the sender sees on an accepted message
pub const SENT_MESSAGE: &str = "sent";

impl From<&ChatEnvelope> for ChatDelivery {
    fn from(envelope: &ChatEnvelope) -> Self {
        Self {
            success: true,
            message: SENT_MESSAGE.to_string(),
            message_id: envelope.message_id,
            from: envelope.sender_id.clone(),
            content: envelope.content.clone(),
            message_type: envelope.message_type.clone(),
            extra: envelope.extra.clone(),
            timestamp: envelope.timestamp,
            conversation: envelope.conversation_id.clone(),
            is_group: envelope.is_group,
        }
    }
}
