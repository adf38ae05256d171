//! Authentication.
//!
//! Stateless HS256 bearer tokens. HTTP handlers take the token from the
//! `Authorization` header; WebSocket upgrades take it from the `?token=`
//! query parameter because browsers cannot set headers on `ws://` requests.

mod claims;
mod error;

pub use claims::Claims;
pub use error::AuthError;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::warn;
use std::sync::Arc;

/// Token lifetime for minted tokens.
const TOKEN_TTL_SECS: i64 = 3600 * 24;

/// Shared verification state.
#[derive(Clone)]
pub struct AuthState {
    secret: Arc<String>,
    decoding_key: Arc<DecodingKey>,
}

impl AuthState {
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        let secret = jwt_secret.into();
        let decoding_key = DecodingKey::from_secret(secret.as_bytes());
        Self {
            secret: Arc::new(secret),
            decoding_key: Arc::new(decoding_key),
        }
    }

    /// Validate a bearer token and return its claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();

        let token_data =
            decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
                warn!("JWT validation failed: {:?}", e);
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                    _ => AuthError::InvalidToken(e.to_string()),
                }
            })?;

        Ok(token_data.claims)
    }

    /// Mint a token for a user id.
    pub fn generate_token(&self, user_id: &str) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: now + TOKEN_TTL_SECS,
            iat: Some(now),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

/// Extract a bearer token from an `Authorization` header value.
pub fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if token.is_empty() || parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips() {
        let auth = AuthState::new("test-secret");
        let token = auth.generate_token("user-1").unwrap();
        let claims = auth.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let minting = AuthState::new("secret-a");
        let verifying = AuthState::new("secret-b");
        let token = minting.generate_token("user-1").unwrap();
        assert!(matches!(
            verifying.validate_token(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let auth = AuthState::new("test-secret");
        assert!(auth.validate_token("not-a-jwt").is_err());
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(bearer_token_from_header("Bearer abc").unwrap(), "abc");
        assert_eq!(bearer_token_from_header("bearer abc").unwrap(), "abc");
        assert!(bearer_token_from_header("Basic abc").is_err());
        assert!(bearer_token_from_header("Bearer").is_err());
        assert!(bearer_token_from_header("Bearer a b").is_err());
    }
}
