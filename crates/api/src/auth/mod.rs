//! Credential verification
//!
//! The gateway never mints credentials. It verifies bearer tokens on the chat login
//! frame, the signaling handshake, and the offline-sync HTTP API.

pub mod jwt;

pub use jwt::{Claims, JwtError, JwtVerifier};

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use chatgate_shared::GatewayResult;

use crate::error::ApiError;
use crate::state::AppState;

pub trait CredentialVerifier: Send + Sync {
    /// Resolve a token to the user id it was issued for
    fn verify(&self, token: &str) -> GatewayResult<String>;
}

/// Authenticated caller of an HTTP route, resolved from `Authorization: Bearer`
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::Unauthorized)?;

        let user_id = state
            .verifier
            .verify(token)
            .map_err(|_| ApiError::InvalidToken)?;
        Ok(Self { user_id })
    }
}
