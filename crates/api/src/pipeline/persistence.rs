//! Persistence consumer
//!
//! Consumes `private.message`, writes the message and both conversation summaries in
//! one transaction, then hands the message to dispatch on `offline.message`.

use std::sync::Arc;

use async_trait::async_trait;
use chatgate_shared::{ChatEnvelope, GatewayResult};

use crate::queue::{Envelope, EnvelopeHandler, Publisher};
use crate::store::{MessageStore, PersistOutcome};

pub struct PersistenceConsumer {
    messages: Arc<dyn MessageStore>,
    publisher: Publisher,
}

impl PersistenceConsumer {
    pub fn new(messages: Arc<dyn MessageStore>, publisher: Publisher) -> Self {
        Self { messages, publisher }
    }
}

#[async_trait]
impl EnvelopeHandler for PersistenceConsumer {
    fn name(&self) -> &'static str {
        "persistence"
    }

    async fn handle(&self, envelope: &Envelope) -> GatewayResult<()> {
        let chat: ChatEnvelope = envelope.decode()?;

        match self.messages.persist(&chat.to_message()).await? {
            PersistOutcome::Inserted => {
                tracing::debug!(
                    message_id = chat.message_id,
                    conversation_id = %chat.conversation_id,
                    "Message persisted"
                );
            }
            PersistOutcome::Duplicate => {
                // Redelivery after a lost ack; dispatch again so the recipient still gets it
                tracing::info!(
                    message_id = chat.message_id,
                    redelivered = envelope.redelivered,
                    "Duplicate message, skipping write"
                );
            }
        }

        self.publisher.publish_dispatch(&chat).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Disposition, MemoryBroker, Topology, OFFLINE_MESSAGE_KEY, PRIVATE_MESSAGE_KEY};
    use crate::store::MemoryStore;
    use time::OffsetDateTime;

    fn envelope(id: i64) -> ChatEnvelope {
        ChatEnvelope {
            message_id: id,
            conversation_id: "alice_bob".into(),
            sender_id: "alice".into(),
            receiver_id: "bob".into(),
            message_type: "text".into(),
            content: "hi".into(),
            extra: String::new(),
            is_group: false,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    fn setup() -> (PersistenceConsumer, Arc<MemoryStore>, Arc<MemoryBroker>) {
        let topology = Topology::default();
        let broker = Arc::new(MemoryBroker::new(&topology));
        let store = Arc::new(MemoryStore::new());
        let consumer = PersistenceConsumer::new(store.clone(), Publisher::new(broker.clone(), topology));
        (consumer, store, broker)
    }

    fn delivery(chat: &ChatEnvelope) -> Envelope {
        Envelope {
            routing_key: PRIVATE_MESSAGE_KEY.into(),
            payload: serde_json::to_vec(chat).unwrap(),
            redelivered: false,
        }
    }

    #[tokio::test]
    async fn test_persists_and_republishes() {
        let (consumer, store, broker) = setup();
        let chat = envelope(100);

        consumer.handle(&delivery(&chat)).await.unwrap();

        assert_eq!(store.message_count(), 1);
        let receiver = store.summary("bob", "alice_bob").await.unwrap().unwrap();
        assert_eq!(receiver.unread_count, 1);
        let sender = store.summary("alice", "alice_bob").await.unwrap().unwrap();
        assert_eq!(sender.unread_count, 0);

        let dispatched = broker.published_with_key(OFFLINE_MESSAGE_KEY);
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].decode::<ChatEnvelope>().unwrap(), chat);
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent_but_still_dispatched() {
        let (consumer, store, broker) = setup();
        let chat = envelope(101);

        consumer.handle(&delivery(&chat)).await.unwrap();
        consumer.handle(&delivery(&chat)).await.unwrap();

        assert_eq!(store.message_count(), 1);
        let receiver = store.summary("bob", "alice_bob").await.unwrap().unwrap();
        assert_eq!(receiver.unread_count, 1);
        assert_eq!(broker.published_with_key(OFFLINE_MESSAGE_KEY).len(), 2);
    }

    #[tokio::test]
    async fn test_store_outage_requeues() {
        let (consumer, store, broker) = setup();
        store.fail_writes(true);

        let disposition = crate::queue::settle(&consumer, &delivery(&envelope(102))).await;
        assert_eq!(disposition, Disposition::Requeue);
        assert!(broker.published_with_key(OFFLINE_MESSAGE_KEY).is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_requeues() {
        let (consumer, _store, broker) = setup();
        broker.fail_publishes(true);

        let disposition = crate::queue::settle(&consumer, &delivery(&envelope(103))).await;
        assert_eq!(disposition, Disposition::Requeue);
    }

    #[tokio::test]
    async fn test_garbage_payload_rejected() {
        let (consumer, _, _) = setup();
        let bad = Envelope {
            routing_key: PRIVATE_MESSAGE_KEY.into(),
            payload: b"{not json".to_vec(),
            redelivered: false,
        };
        assert_eq!(crate::queue::settle(&consumer, &bad).await, Disposition::Reject);
    }
}
