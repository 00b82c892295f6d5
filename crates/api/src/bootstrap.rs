//! Process startup shared by the gateway and worker binaries
//!
//! Initialization order: tracing, config, Postgres (with migrations), Redis, AMQP.
//! Consumers are spawned last through [`spawn_consumer`].

use std::sync::Arc;

use chatgate_shared::{create_migration_pool, create_pool, run_migrations};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::presence::{presence_ttl, RedisPresence};
use crate::queue::{supervise, AmqpBroker, Broker, EnvelopeHandler};
use crate::social::PgSocialGraph;
use crate::state::Infrastructure;
use crate::store::PgStore;

/// Install the global subscriber. `LOG_FORMAT=json` selects JSON output.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Connected infrastructure plus the concrete broker, kept for shutdown
pub struct Connected {
    pub infra: Infrastructure,
    pub broker: Arc<AmqpBroker>,
}

pub async fn connect(config: &Config, consumer_tag_prefix: &str) -> anyhow::Result<Connected> {
    tracing::info!("Running database migrations");
    let migration_pool = create_migration_pool(&config.database_url).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    tracing::info!("Database connected");

    let presence_ttl = presence_ttl(config.read_timeout);
    let presence = Arc::new(RedisPresence::connect(&config.redis_url, presence_ttl).await?);
    tracing::info!("Redis connected");

    let broker = Arc::new(AmqpBroker::connect(&config.amqp_url, &config.topology, consumer_tag_prefix).await?);

    let store = Arc::new(PgStore::new(pool.clone()));
    let infra = Infrastructure {
        presence,
        messages: store.clone(),
        offline: store.clone(),
        push_log: store,
        social: Arc::new(PgSocialGraph::new(pool)),
        broker: broker.clone(),
    };
    Ok(Connected { infra, broker })
}

/// Spawn a supervised consumer for `queue`
pub fn spawn_consumer<H>(
    broker: Arc<dyn Broker>,
    queue: &str,
    handler: H,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    H: EnvelopeHandler + 'static,
{
    tracing::info!(consumer = handler.name(), queue = %queue, "Starting consumer");
    tokio::spawn(supervise(broker, queue.to_string(), Arc::new(handler), shutdown))
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
