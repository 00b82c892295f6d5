//! Durable queue
//!
//! Two topic exchanges (chat, notification) and four durable queues. Publishers go
//! through [`Publisher`]; consumers implement [`EnvelopeHandler`] and are driven by
//! [`Broker::consume`], which settles every delivery through [`settle`].

mod amqp;
mod memory;
mod supervisor;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;
pub use supervisor::supervise;

use std::sync::Arc;

use async_trait::async_trait;
use chatgate_shared::{ChatEnvelope, GatewayError, GatewayResult, PushTask};
use serde::Serialize;
use tokio::sync::watch;

pub const PRIVATE_MESSAGE_KEY: &str = "private.message";
pub const GROUP_MESSAGE_KEY: &str = "group.message";
pub const OFFLINE_MESSAGE_KEY: &str = "offline.message";
pub const PUSH_TASK_KEY: &str = "push.task";

/// Exchange and queue names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub chat_exchange: String,
    pub notification_exchange: String,
    pub private_message_queue: String,
    pub group_message_queue: String,
    pub offline_message_queue: String,
    pub push_task_queue: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            chat_exchange: "netherlink.chat".to_string(),
            notification_exchange: "netherlink.notification".to_string(),
            private_message_queue: "netherlink.private_messages".to_string(),
            group_message_queue: "netherlink.group_messages".to_string(),
            offline_message_queue: "netherlink.offline_messages".to_string(),
            push_task_queue: "netherlink.push_tasks".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: &'static str,
}

impl Topology {
    pub fn exchanges(&self) -> [&str; 2] {
        [self.chat_exchange.as_str(), self.notification_exchange.as_str()]
    }

    pub fn bindings(&self) -> Vec<Binding> {
        let bind = |queue: &str, exchange: &str, routing_key| Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key,
        };
        vec![
            bind(&self.private_message_queue, &self.chat_exchange, PRIVATE_MESSAGE_KEY),
            bind(&self.group_message_queue, &self.chat_exchange, GROUP_MESSAGE_KEY),
            bind(&self.offline_message_queue, &self.chat_exchange, OFFLINE_MESSAGE_KEY),
            bind(&self.push_task_queue, &self.notification_exchange, PUSH_TASK_KEY),
        ]
    }
}

/// One delivery as seen by a handler
#[derive(Debug, Clone)]
pub struct Envelope {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

impl Envelope {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> GatewayResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Name used in logs and consumer tags
    fn name(&self) -> &'static str;

    async fn handle(&self, envelope: &Envelope) -> GatewayResult<()>;
}

/// What the consumer loop does with a delivery after the handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Negative-acknowledge with requeue
    Requeue,
    /// Negative-acknowledge without requeue (dead-letter if configured)
    Reject,
    /// Requeue, then stop this consumer instance
    Stop,
}

pub async fn settle(handler: &dyn EnvelopeHandler, envelope: &Envelope) -> Disposition {
    match handler.handle(envelope).await {
        Ok(()) => Disposition::Ack,
        Err(err) if err.is_retryable() => {
            tracing::warn!(
                consumer = handler.name(),
                routing_key = %envelope.routing_key,
                redelivered = envelope.redelivered,
                error = %err,
                "Handler failed transiently, requeueing"
            );
            Disposition::Requeue
        }
        Err(GatewayError::Fatal(detail)) => {
            tracing::error!(
                consumer = handler.name(),
                error = %detail,
                "Fatal handler error, stopping consumer"
            );
            Disposition::Stop
        }
        Err(err) => {
            tracing::warn!(
                consumer = handler.name(),
                routing_key = %envelope.routing_key,
                error = %err,
                "Rejecting undeliverable envelope"
            );
            Disposition::Reject
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> GatewayResult<()>;

    /// Consume `queue` with prefetch 1 until `shutdown` flips (Ok) or the consumer
    /// has to stop (Err).
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn EnvelopeHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> GatewayResult<()>;

    async fn close(&self) -> GatewayResult<()> {
        Ok(())
    }
}

/// Typed publishing on top of a [`Broker`]
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    topology: Topology,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology) -> Self {
        Self { broker, topology }
    }

    async fn publish_json<T: Serialize + Sync>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> GatewayResult<()> {
        let payload = serde_json::to_vec(value).map_err(|e| GatewayError::fatal(e.to_string()))?;
        self.broker.publish(exchange, routing_key, payload).await
    }

    /// Ingestion -> persistence
    pub async fn publish_chat(&self, envelope: &ChatEnvelope) -> GatewayResult<()> {
        self.publish_json(&self.topology.chat_exchange, PRIVATE_MESSAGE_KEY, envelope)
            .await
    }

    /// Persistence -> dispatch
    pub async fn publish_dispatch(&self, envelope: &ChatEnvelope) -> GatewayResult<()> {
        self.publish_json(&self.topology.chat_exchange, OFFLINE_MESSAGE_KEY, envelope)
            .await
    }

    /// Dispatch -> push fanout
    pub async fn publish_push(&self, task: &PushTask) -> GatewayResult<()> {
        self.publish_json(&self.topology.notification_exchange, PUSH_TASK_KEY, task)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        result: fn() -> GatewayResult<()>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EnvelopeHandler for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn handle(&self, _envelope: &Envelope) -> GatewayResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn envelope() -> Envelope {
        Envelope {
            routing_key: PRIVATE_MESSAGE_KEY.to_string(),
            payload: b"{}".to_vec(),
            redelivered: false,
        }
    }

    async fn disposition_for(result: fn() -> GatewayResult<()>) -> Disposition {
        let handler = Scripted {
            result,
            calls: AtomicUsize::new(0),
        };
        let disposition = settle(&handler, &envelope()).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        disposition
    }

    #[tokio::test]
    async fn test_settle_maps_error_kinds() {
        assert_eq!(disposition_for(|| Ok(())).await, Disposition::Ack);
        assert_eq!(
            disposition_for(|| Err(GatewayError::transient("db down"))).await,
            Disposition::Requeue
        );
        assert_eq!(
            disposition_for(|| Err(GatewayError::validation("bad json"))).await,
            Disposition::Reject
        );
        assert_eq!(
            disposition_for(|| Err(GatewayError::fatal("corrupt"))).await,
            Disposition::Stop
        );
    }

    #[test]
    fn test_bindings() {
        let topology = Topology::default();
        let bindings = topology.bindings();
        assert_eq!(bindings.len(), 4);

        let push = bindings
            .iter()
            .find(|b| b.routing_key == PUSH_TASK_KEY)
            .unwrap();
        assert_eq!(push.exchange, topology.notification_exchange);
        assert!(bindings
            .iter()
            .filter(|b| b.routing_key != PUSH_TASK_KEY)
            .all(|b| b.exchange == topology.chat_exchange));
    }
}
