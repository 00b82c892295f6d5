//! AMQP 0-9-1 broker

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatgate_shared::{GatewayError, GatewayResult};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{watch, RwLock};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use super::{settle, Broker, Disposition, EnvelopeHandler, Envelope, Topology};

const CONNECT_BASE_DELAY: Duration = Duration::from_millis(200);
const CONNECT_MAX_DELAY: Duration = Duration::from_secs(5);
const CONNECT_ATTEMPTS: usize = 8;

/// Persistent delivery mode
const PERSISTENT: u8 = 2;

/// One live connection and its publisher channel
struct Link {
    connection: Arc<Connection>,
    /// Publisher channel in confirm mode
    publish_channel: Channel,
}

impl Link {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.publish_channel.status().connected()
    }
}

pub struct AmqpBroker {
    url: String,
    topology: Topology,
    link: RwLock<Link>,
    consumer_tag_prefix: String,
}

impl AmqpBroker {
    /// Connect with exponential backoff, then declare the topology
    pub async fn connect(url: &str, topology: &Topology, consumer_tag_prefix: &str) -> GatewayResult<Self> {
        let link = open_link(url, topology, CONNECT_ATTEMPTS).await?;
        tracing::info!("AMQP broker connected and topology declared");
        Ok(Self {
            url: url.to_string(),
            topology: topology.clone(),
            link: RwLock::new(link),
            consumer_tag_prefix: consumer_tag_prefix.to_string(),
        })
    }

    /// The current connection and publisher channel, reopened first if either has died.
    /// A reopen makes a single attempt; callers and the consumer supervisor pace retries.
    async fn link(&self) -> GatewayResult<(Arc<Connection>, Channel)> {
        {
            let link = self.link.read().await;
            if link.is_open() {
                return Ok((link.connection.clone(), link.publish_channel.clone()));
            }
        }

        let mut link = self.link.write().await;
        if !link.is_open() {
            tracing::warn!("AMQP connection lost, reconnecting");
            *link = open_link(&self.url, &self.topology, 1).await?;
            tracing::info!("AMQP broker reconnected and topology redeclared");
        }
        Ok((link.connection.clone(), link.publish_channel.clone()))
    }
}

async fn open_link(url: &str, topology: &Topology, attempts: usize) -> GatewayResult<Link> {
    let retry_strategy = ExponentialBackoff::from_millis(CONNECT_BASE_DELAY.as_millis() as u64)
        .max_delay(CONNECT_MAX_DELAY)
        .map(jitter)
        .take(attempts.saturating_sub(1));

    let connection = Retry::spawn(retry_strategy, || async {
        Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "AMQP connection attempt failed");
                e
            })
    })
    .await
    .map_err(GatewayError::transient)?;

    let publish_channel = connection
        .create_channel()
        .await
        .map_err(GatewayError::transient)?;
    publish_channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(GatewayError::transient)?;
    declare(&publish_channel, topology).await?;

    Ok(Link {
        connection: Arc::new(connection),
        publish_channel,
    })
}

async fn declare(channel: &Channel, topology: &Topology) -> GatewayResult<()> {
    let durable_exchange = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };
    for exchange in topology.exchanges() {
        channel
            .exchange_declare(exchange, ExchangeKind::Topic, durable_exchange, FieldTable::default())
            .await
            .map_err(GatewayError::transient)?;
    }

    let durable_queue = QueueDeclareOptions {
        durable: true,
        ..Default::default()
    };
    for binding in topology.bindings() {
        channel
            .queue_declare(&binding.queue, durable_queue, FieldTable::default())
            .await
            .map_err(GatewayError::transient)?;
        channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(GatewayError::transient)?;
    }
    Ok(())
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> GatewayResult<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        let (_, publish_channel) = self.link().await?;
        let confirmation = publish_channel
            .basic_publish(exchange, routing_key, BasicPublishOptions::default(), &payload, properties)
            .await
            .map_err(GatewayError::transient)?
            .await
            .map_err(GatewayError::transient)?;

        if confirmation.is_nack() {
            return Err(GatewayError::transient(format!(
                "broker refused publish to {exchange}/{routing_key}"
            )));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn EnvelopeHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> GatewayResult<()> {
        let (connection, _) = self.link().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(GatewayError::transient)?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(GatewayError::transient)?;

        let tag = format!("{}-{}", self.consumer_tag_prefix, handler.name());
        let mut consumer = channel
            .basic_consume(queue, &tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(GatewayError::transient)?;

        tracing::info!(queue = %queue, consumer = handler.name(), "Consumer started");

        loop {
            let delivery = tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!(consumer = handler.name(), "Consumer shutting down");
                    // Unacked deliveries return to the queue when the channel closes
                    let _ = channel.close(200, "shutdown").await;
                    return Ok(());
                }
                next = consumer.next() => next,
            };

            let delivery = match delivery {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(GatewayError::transient(e)),
                None => return Err(GatewayError::transient("consumer stream closed")),
            };

            let envelope = Envelope {
                routing_key: delivery.routing_key.to_string(),
                payload: delivery.data.clone(),
                redelivered: delivery.redelivered,
            };

            let requeue = BasicNackOptions {
                requeue: true,
                ..Default::default()
            };
            match settle(handler.as_ref(), &envelope).await {
                Disposition::Ack => delivery
                    .acker
                    .ack(BasicAckOptions::default())
                    .await
                    .map_err(GatewayError::transient)?,
                Disposition::Requeue => delivery
                    .acker
                    .nack(requeue)
                    .await
                    .map_err(GatewayError::transient)?,
                Disposition::Reject => delivery
                    .acker
                    .nack(BasicNackOptions::default())
                    .await
                    .map_err(GatewayError::transient)?,
                Disposition::Stop => {
                    let _ = delivery.acker.nack(requeue).await;
                    return Err(GatewayError::fatal(format!(
                        "consumer {} stopped on fatal error",
                        handler.name()
                    )));
                }
            }
        }
    }

    async fn close(&self) -> GatewayResult<()> {
        let connection = self.link.read().await.connection.clone();
        connection
            .close(200, "shutdown")
            .await
            .map_err(GatewayError::transient)
    }
}
