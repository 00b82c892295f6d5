//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chatgate_shared::GatewayError;
use serde_json::json;

/// HTTP-facing error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Resource errors
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),

    // Infrastructure errors
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),

            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),

            // Resources
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Infrastructure details stay in the logs
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Validation(msg) => ApiError::Validation(msg),
            GatewayError::Auth(_) => ApiError::InvalidToken,
            GatewayError::Conflict(msg) => ApiError::Conflict(msg),
            GatewayError::NotFound(msg) => ApiError::NotFound(msg),
            GatewayError::Transient(detail) => {
                tracing::error!(error = %detail, "Infrastructure unavailable");
                ApiError::ServiceUnavailable
            }
            GatewayError::Fatal(detail) => {
                tracing::error!(error = %detail, "Fatal error in request path");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_mapping() {
        assert!(matches!(
            ApiError::from(GatewayError::validation("bad page")),
            ApiError::Validation(m) if m == "bad page"
        ));
        assert!(matches!(
            ApiError::from(GatewayError::auth("uid mismatch")),
            ApiError::InvalidToken
        ));
        assert!(matches!(
            ApiError::from(GatewayError::transient("redis down")),
            ApiError::ServiceUnavailable
        ));
        assert!(matches!(
            ApiError::from(GatewayError::fatal("corrupt")),
            ApiError::Internal
        ));
    }

    #[tokio::test]
    async fn test_error_body_hides_infrastructure_detail() {
        let response = ApiError::from(GatewayError::transient("redis at 10.0.0.5 refused")).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
        assert!(!body.to_string().contains("10.0.0.5"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::Unauthorized.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Validation("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::ServiceUnavailable.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
