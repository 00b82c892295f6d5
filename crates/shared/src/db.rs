//! Postgres pools and schema migrations

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::{str::FromStr, time::Duration};

/// Migrations for the message, offline index, and push log tables
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Pool tuning for one process
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl PoolSettings {
    /// Long-lived gateway or worker pool
    pub fn serving(max_connections: u32) -> Self {
        Self {
            max_connections: max_connections.max(1),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(300),
        }
    }

    /// Single connection with a generous acquire timeout
    pub fn migration() -> Self {
        Self {
            max_connections: 1,
            acquire_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(180),
        }
    }
}

async fn connect(database_url: &str, settings: PoolSettings) -> Result<PgPool, sqlx::Error> {
    // Prepared statements break behind PgBouncer in transaction mode
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(0)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .max_lifetime(settings.max_lifetime)
        .connect_with(options)
        .await
}

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    connect(database_url, PoolSettings::serving(max_connections)).await
}

pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    connect(database_url, PoolSettings::migration()).await
}

/// Apply pending migrations. Safe to run from every gateway and worker at startup.
pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
