//! Message ingestion
//!
//! Validates a chat frame, assigns the message id, acknowledges the sender, and hands
//! the message to the durable queue. Persistence happens downstream.

use std::sync::Arc;

use chatgate_shared::{conversation_id, ChatEnvelope, GatewayError, GatewayResult, MessageIdGenerator, MessageType};
use time::OffsetDateTime;

use crate::queue::Publisher;
use crate::websocket::connection::Connection;
use crate::websocket::events::{ChatDelivery, ChatPayload, ServerFrame};
use crate::websocket::registry::ConnectionRegistry;

pub struct Ingestor {
    ids: MessageIdGenerator,
    publisher: Publisher,
    registry: Arc<ConnectionRegistry>,
}

impl Ingestor {
    pub fn new(node_id: u16, publisher: Publisher, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            ids: MessageIdGenerator::new(node_id),
            publisher,
            registry,
        }
    }

    /// Build the queue envelope for a chat frame, or reject it
    pub fn prepare(&self, sender_id: &str, payload: ChatPayload) -> GatewayResult<ChatEnvelope> {
        if payload.to.is_empty() || payload.content.is_empty() {
            return Err(GatewayError::validation("missing required fields: to, content"));
        }
        let message_type: MessageType = payload.message_type.parse()?;
        if payload.is_group {
            return Err(GatewayError::validation("group messages are not supported"));
        }

        Ok(ChatEnvelope {
            message_id: self.ids.next_id(),
            conversation_id: conversation_id(sender_id, &payload.to),
            sender_id: sender_id.to_string(),
            receiver_id: payload.to,
            message_type: message_type.to_string(),
            content: payload.content,
            extra: payload.extra,
            is_group: false,
            timestamp: OffsetDateTime::now_utc(),
        })
    }

    /// Accept a chat frame from `sender_id` over `sender`
    pub async fn ingest(
        &self,
        sender_id: &str,
        sender: &Connection,
        payload: ChatPayload,
    ) -> GatewayResult<ChatEnvelope> {
        let envelope = self.prepare(sender_id, payload)?;
        let delivery = ChatDelivery::from(&envelope);

        if let Err(e) = sender.send(&ServerFrame::ChatResponse(delivery.clone())) {
            tracing::warn!(
                user_id = %sender_id,
                message_id = envelope.message_id,
                error = %e,
                "Could not queue chat_response to sender"
            );
        }

        match self.publisher.publish_chat(&envelope).await {
            Ok(()) => {
                tracing::debug!(
                    message_id = envelope.message_id,
                    sender_id = %envelope.sender_id,
                    receiver_id = %envelope.receiver_id,
                    "Message enqueued"
                );
            }
            Err(e) => {
                tracing::error!(
                    message_id = envelope.message_id,
                    error = %e,
                    "Failed to publish message, attempting direct delivery"
                );
                self.deliver_directly(&envelope, delivery).await;
            }
        }

        Ok(envelope)
    }

    /// Best-effort delivery when the queue is unavailable. Nothing is persisted.
    async fn deliver_directly(&self, envelope: &ChatEnvelope, delivery: ChatDelivery) {
        let Some(conn) = self.registry.lookup(&envelope.receiver_id).await else {
            tracing::warn!(
                message_id = envelope.message_id,
                receiver_id = %envelope.receiver_id,
                "Recipient not connected here, message not delivered"
            );
            return;
        };
        if let Err(e) = conn.send(&ServerFrame::Chat(delivery)) {
            tracing::warn!(
                message_id = envelope.message_id,
                receiver_id = %envelope.receiver_id,
                error = %e,
                "Direct delivery failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryBroker, Topology, PRIVATE_MESSAGE_KEY};
    use serde_json::Value;

    fn chat(to: &str, content: &str) -> ChatPayload {
        ChatPayload {
            to: to.into(),
            content: content.into(),
            message_type: "text".into(),
            extra: String::new(),
            is_group: false,
        }
    }

    fn setup() -> (Ingestor, Arc<MemoryBroker>, Arc<ConnectionRegistry>) {
        let topology = Topology::default();
        let broker = Arc::new(MemoryBroker::new(&topology));
        let registry = Arc::new(ConnectionRegistry::new());
        let ingestor = Ingestor::new(1, Publisher::new(broker.clone(), topology), registry.clone());
        (ingestor, broker, registry)
    }

    #[test]
    fn test_validation() {
        let (ingestor, _, _) = setup();
        assert!(ingestor.prepare("alice", chat("", "hi")).is_err());
        assert!(ingestor.prepare("alice", chat("bob", "")).is_err());

        let mut image = chat("bob", "hi");
        image.message_type = "image".into();
        assert!(matches!(ingestor.prepare("alice", image), Err(GatewayError::Validation(_))));

        let mut group = chat("bob", "hi");
        group.is_group = true;
        assert!(ingestor.prepare("alice", group).is_err());

        let envelope = ingestor.prepare("bob", chat("alice", "hi")).unwrap();
        assert_eq!(envelope.conversation_id, "alice_bob");
    }

    #[tokio::test]
    async fn test_ack_precedes_publish() {
        let (ingestor, broker, _) = setup();
        let (sender, mut rx) = Connection::new(8);

        let envelope = ingestor.ingest("alice", &sender, chat("bob", "hi")).await.unwrap();

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "chat_response");
        assert_eq!(frame["payload"]["success"], true);
        assert_eq!(frame["payload"]["message_id"], envelope.message_id);

        let published = broker.published_with_key(PRIVATE_MESSAGE_KEY);
        assert_eq!(published.len(), 1);
        let queued: ChatEnvelope = published[0].decode().unwrap();
        assert_eq!(queued, envelope);
    }

    #[tokio::test]
    async fn test_publish_failure_falls_back_to_direct_delivery() {
        let (ingestor, broker, registry) = setup();
        broker.fail_publishes(true);

        let (receiver, mut receiver_rx) = Connection::new(8);
        registry.register("bob", Arc::new(receiver)).await;
        let (sender, _sender_rx) = Connection::new(8);

        ingestor.ingest("alice", &sender, chat("bob", "hi")).await.unwrap();

        let frame: Value = serde_json::from_str(&receiver_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "chat");
        assert_eq!(frame["payload"]["from"], "alice");
    }

    #[tokio::test]
    async fn test_ids_increase() {
        let (ingestor, _, _) = setup();
        let (sender, _rx) = Connection::new(16);
        let first = ingestor.ingest("alice", &sender, chat("bob", "1")).await.unwrap();
        let second = ingestor.ingest("alice", &sender, chat("bob", "2")).await.unwrap();
        assert!(second.message_id > first.message_id);
    }
}
