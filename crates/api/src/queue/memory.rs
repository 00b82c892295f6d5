//! In-process broker for tests
//!
//! Routes publishes through the same bindings as the real topology (exact routing
//! keys only) and records every publish so tests can assert on them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chatgate_shared::{GatewayError, GatewayResult};
use tokio::sync::{watch, Notify};

use super::{settle, Binding, Broker, Disposition, EnvelopeHandler, Envelope, Topology};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> GatewayResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, VecDeque<Envelope>>,
    published: Vec<Published>,
    fail_publishes: bool,
}

pub struct MemoryBroker {
    bindings: Vec<Binding>,
    inner: Mutex<Inner>,
    notify: Notify,
}

fn poisoned<T>(_: T) -> GatewayError {
    GatewayError::fatal("broker lock poisoned")
}

impl MemoryBroker {
    pub fn new(topology: &Topology) -> Self {
        Self {
            bindings: topology.bindings(),
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Make every subsequent publish fail with a transient error
    pub fn fail_publishes(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_publishes = fail;
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.inner
            .lock()
            .map(|inner| inner.published.clone())
            .unwrap_or_default()
    }

    pub fn published_with_key(&self, routing_key: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.routing_key == routing_key)
            .collect()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.queues.get(queue).map(VecDeque::len))
            .unwrap_or(0)
    }

    fn pop(&self, queue: &str) -> GatewayResult<Option<Envelope>> {
        let mut inner = self.inner.lock().map_err(poisoned)?;
        Ok(inner.queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    fn requeue(&self, queue: &str, mut envelope: Envelope) -> GatewayResult<()> {
        envelope.redelivered = true;
        let mut inner = self.inner.lock().map_err(poisoned)?;
        inner.queues.entry(queue.to_string()).or_default().push_back(envelope);
        Ok(())
    }

    /// Settle every envelope currently in `queue`, one at a time.
    /// Requeued envelopes are not retried within the same call.
    pub async fn drain(&self, queue: &str, handler: &dyn EnvelopeHandler) -> GatewayResult<usize> {
        let pending = self.queue_len(queue);
        let mut settled = 0;
        for _ in 0..pending {
            let Some(envelope) = self.pop(queue)? else {
                break;
            };
            match settle(handler, &envelope).await {
                Disposition::Ack | Disposition::Reject => {}
                Disposition::Requeue => self.requeue(queue, envelope)?,
                Disposition::Stop => {
                    self.requeue(queue, envelope)?;
                    return Err(GatewayError::fatal(format!(
                        "consumer {} stopped on fatal error",
                        handler.name()
                    )));
                }
            }
            settled += 1;
        }
        Ok(settled)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> GatewayResult<()> {
        let mut inner = self.inner.lock().map_err(poisoned)?;
        if inner.fail_publishes {
            return Err(GatewayError::transient("broker unavailable"));
        }
        inner.published.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.clone(),
        });
        for binding in self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
        {
            inner
                .queues
                .entry(binding.queue.clone())
                .or_default()
                .push_back(Envelope {
                    routing_key: routing_key.to_string(),
                    payload: payload.clone(),
                    redelivered: false,
                });
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn EnvelopeHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> GatewayResult<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let notified = self.notify.notified();
            if self.drain(queue, handler.as_ref()).await? == 0 {
                tokio::select! {
                    _ = notified => {}
                    _ = shutdown.changed() => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{PRIVATE_MESSAGE_KEY, PUSH_TASK_KEY};

    struct Failing;

    #[async_trait]
    impl EnvelopeHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn handle(&self, _envelope: &Envelope) -> GatewayResult<()> {
            Err(GatewayError::transient("store down"))
        }
    }

    #[tokio::test]
    async fn test_routes_by_binding() {
        let topology = Topology::default();
        let broker = MemoryBroker::new(&topology);

        broker
            .publish(&topology.chat_exchange, PRIVATE_MESSAGE_KEY, b"{}".to_vec())
            .await
            .unwrap();
        broker
            .publish(&topology.notification_exchange, PUSH_TASK_KEY, b"{}".to_vec())
            .await
            .unwrap();
        // Wrong exchange for this key: recorded but not routed
        broker
            .publish(&topology.notification_exchange, PRIVATE_MESSAGE_KEY, b"{}".to_vec())
            .await
            .unwrap();

        assert_eq!(broker.queue_len(&topology.private_message_queue), 1);
        assert_eq!(broker.queue_len(&topology.push_task_queue), 1);
        assert_eq!(broker.published().len(), 3);
    }

    #[tokio::test]
    async fn test_requeue_marks_redelivered() {
        let topology = Topology::default();
        let broker = MemoryBroker::new(&topology);
        broker
            .publish(&topology.chat_exchange, PRIVATE_MESSAGE_KEY, b"{}".to_vec())
            .await
            .unwrap();

        let settled = broker
            .drain(&topology.private_message_queue, &Failing)
            .await
            .unwrap();
        assert_eq!(settled, 1);
        assert_eq!(broker.queue_len(&topology.private_message_queue), 1);
        let envelope = broker.pop(&topology.private_message_queue).unwrap().unwrap();
        assert!(envelope.redelivered);
    }

    #[tokio::test]
    async fn test_failing_publishes() {
        let topology = Topology::default();
        let broker = MemoryBroker::new(&topology);
        broker.fail_publishes(true);
        let err = broker
            .publish(&topology.chat_exchange, PRIVATE_MESSAGE_KEY, Vec::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(broker.published().is_empty());
    }
}
