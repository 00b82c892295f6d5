//! Dispatch consumer
//!
//! Runs inside a gateway. Delivers persisted messages to recipients connected to this
//! gateway; everyone else gets an offline index entry, an unread bump, and optionally
//! a push task.

use std::sync::Arc;

use async_trait::async_trait;
use chatgate_shared::{ChatEnvelope, GatewayResult, PushTask};

use crate::presence::PresenceStore;
use crate::queue::{Envelope, EnvelopeHandler, Publisher};
use crate::store::OfflineStore;
use crate::websocket::events::{ChatDelivery, ServerFrame};
use crate::websocket::registry::ConnectionRegistry;

pub struct DispatchConsumer {
    gateway_id: String,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<dyn PresenceStore>,
    offline: Arc<dyn OfflineStore>,
    publisher: Publisher,
    push_enabled: bool,
}

/// Where a dispatched message ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Live,
    Offline { new_entry: bool },
}

impl DispatchConsumer {
    pub fn new(
        gateway_id: impl Into<String>,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<dyn PresenceStore>,
        offline: Arc<dyn OfflineStore>,
        publisher: Publisher,
        push_enabled: bool,
    ) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            registry,
            presence,
            offline,
            publisher,
            push_enabled,
        }
    }

    pub async fn route(&self, chat: &ChatEnvelope) -> GatewayResult<Routed> {
        if self.try_deliver(chat).await? {
            return Ok(Routed::Live);
        }
        let new_entry = self.store_offline(chat).await?;
        Ok(Routed::Offline { new_entry })
    }

    /// Push the frame to a connection owned by this gateway. `Ok(false)` means the
    /// recipient has to be treated as offline.
    async fn try_deliver(&self, chat: &ChatEnvelope) -> GatewayResult<bool> {
        let Some(record) = self.presence.get(&chat.receiver_id).await? else {
            return Ok(false);
        };

        if record.gateway_id != self.gateway_id {
            tracing::info!(
                message_id = chat.message_id,
                receiver_id = %chat.receiver_id,
                owner = %record.gateway_id,
                "Recipient connected to another gateway, storing offline"
            );
            return Ok(false);
        }

        let Some(conn) = self.registry.lookup(&chat.receiver_id).await else {
            tracing::debug!(
                message_id = chat.message_id,
                receiver_id = %chat.receiver_id,
                "Presence points here but no local connection"
            );
            return Ok(false);
        };

        match conn.send(&ServerFrame::Chat(ChatDelivery::from(chat))) {
            Ok(()) => {
                tracing::debug!(
                    message_id = chat.message_id,
                    receiver_id = %chat.receiver_id,
                    session_id = %conn.session_id,
                    "Message delivered"
                );
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(
                    message_id = chat.message_id,
                    receiver_id = %chat.receiver_id,
                    error = %e,
                    "Live delivery failed, storing offline"
                );
                Ok(false)
            }
        }
    }

    async fn store_offline(&self, chat: &ChatEnvelope) -> GatewayResult<bool> {
        let created = self
            .offline
            .upsert_entry(&chat.receiver_id, chat.message_id, &chat.conversation_id)
            .await?;

        if created {
            if let Err(e) = self
                .presence
                .incr_unread(&chat.receiver_id, &chat.conversation_id)
                .await
            {
                tracing::warn!(
                    receiver_id = %chat.receiver_id,
                    conversation_id = %chat.conversation_id,
                    error = %e,
                    "Failed to bump unread counter"
                );
            }
        }

        if self.push_enabled {
            self.publisher.publish_push(&PushTask::from(chat)).await?;
        }

        tracing::debug!(
            message_id = chat.message_id,
            receiver_id = %chat.receiver_id,
            new_entry = created,
            "Message stored offline"
        );
        Ok(created)
    }
}

#[async_trait]
impl EnvelopeHandler for DispatchConsumer {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    async fn handle(&self, envelope: &Envelope) -> GatewayResult<()> {
        let chat: ChatEnvelope = envelope.decode()?;
        self.route(&chat).await.map(|_| ())
    }
}
