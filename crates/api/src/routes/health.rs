//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub gateway_id: String,
    pub database: String,
    pub redis: String,
    pub connections: usize,
    pub signaling_connections: usize,
}

fn status(ok: bool) -> String {
    if ok { "healthy" } else { "unhealthy" }.to_string()
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database_ok = state.infra.messages.ping().await.is_ok();
    let redis_ok = state.infra.presence.ping().await.is_ok();
    let healthy = database_ok && redis_ok;

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            status: status(healthy),
            version: env!("CARGO_PKG_VERSION").to_string(),
            gateway_id: state.config.gateway_id.clone(),
            database: status(database_ok),
            redis: status(redis_ok),
            connections: state.gateway.registry.len().await,
            signaling_connections: state.signaling.registry().len().await,
        }),
    )
}

/// Liveness check (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness check (checks if the service is ready to accept traffic)
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.infra.messages.ping().await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
