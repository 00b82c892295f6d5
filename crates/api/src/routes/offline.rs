//! Offline sync routes
//!
//! Pull API for clients that reconnect: list what is pending, confirm what was
//! received, read unread counts, and purge old synced entries.

use axum::{
    extract::{Query, State},
    Json,
};
use chatgate_shared::{OfflinePage, PageRequest, UnreadSummary};
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
    store::MAX_RETENTION_DAYS,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: T,
}

impl<T> ApiResponse<T> {
    fn ok(message: &str, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.to_string(),
            data,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct OfflineQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    /// Restrict to one conversation
    pub conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkSyncedRequest {
    pub message_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct MarkedCount {
    pub marked_count: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct PurgeQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct DeletedCount {
    pub deleted_count: u64,
}

// =============================================================================
// Handlers
// =============================================================================

/// `GET /api/messages/offline`
pub async fn list_offline(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<OfflineQuery>,
) -> ApiResult<Json<ApiResponse<OfflinePage>>> {
    let page = PageRequest::normalize(query.page, query.page_size);
    let conversation = query.conversation_id.as_deref().filter(|c| !c.is_empty());

    let result = state.infra.offline.list(&user.user_id, conversation, page).await?;
    Ok(ApiResponse::ok("ok", result))
}

/// `POST /api/messages/mark_synced`
pub async fn mark_synced(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<MarkSyncedRequest>,
) -> ApiResult<Json<ApiResponse<MarkedCount>>> {
    if request.message_ids.is_empty() {
        return Err(ApiError::Validation("message_ids is required".to_string()));
    }

    let batch = state
        .infra
        .offline
        .mark_synced(&user.user_id, &request.message_ids)
        .await?;

    for conversation_id in &batch.conversation_ids {
        if let Err(e) = state.infra.presence.clear_unread(&user.user_id, conversation_id).await {
            tracing::warn!(user_id = %user.user_id, error = %e, "Failed to clear unread counter");
        }
    }

    tracing::info!(user_id = %user.user_id, marked = batch.count, "Messages marked synced");
    Ok(ApiResponse::ok(
        "ok",
        MarkedCount {
            marked_count: batch.count,
        },
    ))
}

/// `GET /api/messages/unread_count`
pub async fn unread_count(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<ApiResponse<UnreadSummary>>> {
    let summary = state.infra.offline.unread_counts(&user.user_id).await?;
    Ok(ApiResponse::ok("ok", summary))
}

/// `DELETE /api/messages/offline/clear?days=`
///
/// Missing or non-positive `days` falls back to the configured retention.
pub async fn purge_offline(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<PurgeQuery>,
) -> ApiResult<Json<ApiResponse<DeletedCount>>> {
    let days = query
        .days
        .filter(|d| *d >= 1)
        .unwrap_or(state.config.offline_retention_days);
    if days > MAX_RETENTION_DAYS {
        return Err(ApiError::Validation(format!(
            "days must not exceed {MAX_RETENTION_DAYS}"
        )));
    }

    let deleted = state.infra.offline.purge(&user.user_id, days).await?;

    tracing::info!(user_id = %user.user_id, days, deleted, "Purged synced offline entries");
    Ok(ApiResponse::ok(
        "ok",
        DeletedCount {
            deleted_count: deleted,
        },
    ))
}
