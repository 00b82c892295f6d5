//! JWT token validation
//!
//! Tokens are minted by the account service; the gateway only verifies them. A valid
//! token carries the user id in its `uid` claim.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use chatgate_shared::{GatewayError, GatewayResult};

use super::CredentialVerifier;

/// Claims carried by account-service tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub uid: String,
    /// Issuer
    #[serde(default)]
    pub iss: Option<String>,
    /// Expiration
    pub exp: i64,
}

#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate and decode a token
    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => JwtError::Invalid,
                _ => JwtError::Validation(e.to_string()),
            })
    }

    /// Sign a token for `uid`. Used by tooling and tests; production tokens come from
    /// the account service.
    pub fn issue(&self, uid: &str, ttl: Duration) -> Result<String, JwtError> {
        let claims = Claims {
            uid: uid.to_string(),
            iss: Some("netherlink".to_string()),
            exp: (OffsetDateTime::now_utc() + ttl).unix_timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> GatewayResult<String> {
        let claims = self.validate_token(token).map_err(|e| {
            tracing::debug!(error = %e, "Token rejected");
            GatewayError::auth("authentication failed")
        })?;
        if claims.uid.is_empty() {
            return Err(GatewayError::auth("authentication failed"));
        }
        Ok(claims.uid)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token encoding failed: {0}")]
    Encoding(String),
    #[error("Token validation failed: {0}")]
    Validation(String),
}
