//! Pipeline worker
//!
//! Runs the persistence and push consumers out of process so gateways only carry
//! dispatch. Start gateways with `EMBEDDED_CONSUMERS=false` when this runs.

use std::sync::Arc;

use anyhow::Context;
use chatgate_api::{
    bootstrap::{self, spawn_consumer},
    pipeline::{PersistenceConsumer, PushConsumer},
    queue::{Broker, Publisher},
    state::notifier_for,
    Config,
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    bootstrap::init_tracing("chatgate_worker=info,chatgate_api=info");

    let config = Config::from_env().context("invalid configuration")?;
    let tag_prefix = format!("{}-worker", config.gateway_id);
    tracing::info!(worker = %tag_prefix, "Starting pipeline worker");

    let connected = bootstrap::connect(&config, &tag_prefix).await?;
    let broker: Arc<dyn Broker> = connected.broker.clone();
    let infra = connected.infra;
    let publisher = Publisher::new(broker.clone(), config.topology.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumers = vec![
        spawn_consumer(
            broker.clone(),
            &config.topology.private_message_queue,
            PersistenceConsumer::new(infra.messages.clone(), publisher),
            shutdown_rx.clone(),
        ),
        spawn_consumer(
            broker.clone(),
            &config.topology.push_task_queue,
            PushConsumer::new(notifier_for(&config), infra.push_log.clone()),
            shutdown_rx,
        ),
    ];

    bootstrap::shutdown_signal().await;

    shutdown_tx.send_replace(true);
    for consumer in consumers {
        if let Err(e) = consumer.await {
            tracing::warn!(error = ?e, "Consumer task failed");
        }
    }
    if let Err(e) = broker.close().await {
        tracing::warn!(error = %e, "Broker close failed");
    }

    tracing::info!("Pipeline worker stopped");
    Ok(())
}
