//! Chat gateway binary

use std::sync::Arc;

use anyhow::Context;
use chatgate_api::{
    bootstrap::{self, spawn_consumer},
    queue::Broker,
    routes::create_router,
    AppState, Config,
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    bootstrap::init_tracing("chatgate_api=info,tower_http=info");

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        gateway_id = %config.gateway_id,
        bind_address = %config.bind_address,
        embedded_consumers = config.embedded_consumers,
        "Starting chat gateway"
    );

    let connected = bootstrap::connect(&config, &config.gateway_id).await?;
    let broker: Arc<dyn Broker> = connected.broker.clone();
    let topology = config.topology.clone();
    let embedded = config.embedded_consumers;
    let bind_address = config.bind_address.clone();

    let state = AppState::new(config, connected.infra);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Dispatch needs this process's registry, so it always runs here
    let mut consumers = vec![spawn_consumer(
        broker.clone(),
        &topology.offline_message_queue,
        state.dispatch_consumer(),
        shutdown_rx.clone(),
    )];
    if embedded {
        consumers.push(spawn_consumer(
            broker.clone(),
            &topology.private_message_queue,
            state.persistence_consumer(),
            shutdown_rx.clone(),
        ));
        consumers.push(spawn_consumer(
            broker.clone(),
            &topology.push_task_queue,
            state.push_consumer(),
            shutdown_rx.clone(),
        ));
    }

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(address = %bind_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(bootstrap::shutdown_signal())
        .await?;

    shutdown_tx.send_replace(true);
    for consumer in consumers {
        if let Err(e) = consumer.await {
            tracing::warn!(error = ?e, "Consumer task failed");
        }
    }
    if let Err(e) = broker.close().await {
        tracing::warn!(error = %e, "Broker close failed");
    }

    tracing::info!("Chat gateway stopped");
    Ok(())
}
