//! HTTP routes

pub mod health;
pub mod offline;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{signaling::handler::signaling_handler, state::AppState, websocket::ws_handler};

/// Create all routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Offline sync pull API (Bearer token checked by the AuthUser extractor)
    let offline_routes = Router::new()
        .route("/messages/offline", get(offline::list_offline))
        .route("/messages/mark_synced", post(offline::mark_synced))
        .route("/messages/unread_count", get(offline::unread_count))
        .route("/messages/offline/clear", delete(offline::purge_offline));

    let websocket_routes = Router::new()
        .route("/ws", get(ws_handler))
        .route("/ws/webrtc", get(signaling_handler));

    Router::new()
        .merge(health_routes)
        .merge(websocket_routes)
        .nest("/api", offline_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
