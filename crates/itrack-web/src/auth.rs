//! Bearer-token authentication and password hashing.

use std::sync::Arc;

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use itrack_core::{User, UserId};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
const DEV_JWT_SECRET: &str = "dev_jwt_secret";
const DEFAULT_TTL_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication token required")]
    MissingToken,
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token: {0}")]
    TokenInvalid(String),
    #[error("crypto error: {0}")]
    Crypto(String),
}

#[derive(Clone)]
pub struct AuthConfig {
    secret: String,
    pub ttl_secs: i64,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl AuthConfig {
    pub fn new(secret: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl_secs,
        }
    }

    pub fn from_env() -> Self {
        let secret = match std::env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                warn!("JWT_SECRET not set; using the development secret");
                DEV_JWT_SECRET.to_string()
            }
        };
        let ttl_secs = std::env::var("JWT_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TTL_SECS);
        Self::new(secret, ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

pub fn issue_token(user: &User, config: &AuthConfig) -> Result<String, AuthError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user.id.to_string(),
        email: user.email.clone(),
        roles: user.roles.clone(),
        iat: now,
        exp: now + config.ttl_secs,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )
    .map_err(|e| AuthError::Crypto(format!("JWT encode: {e}")))
}

pub fn decode_token(token: &str, config: &AuthConfig) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["sub", "exp", "iat"]);
    jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::TokenInvalid(e.to_string()),
    })
}

/// Argon2id PHC string. Runs on the blocking pool.
pub async fn hash_password(password: String) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || {
        let salt_bytes: [u8; 16] = rand::random();
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| AuthError::Crypto(format!("salt: {e}")))?;
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::Crypto(format!("hash: {e}")))
    })
    .await
    .map_err(|e| AuthError::Crypto(format!("hashing task: {e}")))?
}

/// `Ok(false)` on mismatch; `Err` only when the stored hash is malformed.
pub async fn verify_password(password: String, hash: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash)
            .map_err(|e| AuthError::Crypto(format!("invalid hash format: {e}")))?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AuthError::Crypto(format!("verify: {e}"))),
        }
    })
    .await
    .map_err(|e| AuthError::Crypto(format!("verify task: {e}")))?
}

/// Identity from a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: UserId,
    pub email: String,
    pub roles: Vec<String>,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;
        let claims = decode_token(token, &state.auth)?;
        let id = Uuid::parse_str(&claims.sub)
            .map_err(|_| AuthError::TokenInvalid("subject is not a user id".to_string()))?;
        Ok(Self {
            id,
            email: claims.email,
            roles: claims.roles,
        })
    }
}

/// Guard for admin routes. Open when no admin token is configured.
#[derive(Debug, Clone, Copy)]
pub struct AdminAccess;

impl FromRequestParts<Arc<AppState>> for AdminAccess {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(required) = state.admin_token.as_deref() else {
            return Ok(Self);
        };
        let supplied = parts
            .headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok());
        if supplied.is_some_and(|supplied| tokens_match(supplied, required)) {
            Ok(Self)
        } else {
            Err(ApiError::Unauthorized("admin token required".to_string()))
        }
    }
}

/// Constant-time comparison of SHA-256 digests.
fn tokens_match(supplied: &str, required: &str) -> bool {
    let supplied = Sha256::digest(supplied.as_bytes());
    let required = Sha256::digest(required.as_bytes());
    supplied
        .iter()
        .zip(required.iter())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use itrack_core::{NewUser, Preferences};

    fn user() -> User {
        User::from_new(
            Uuid::new_v4(),
            NewUser {
                name: None,
                email: "Student@Example.test".to_string(),
                password_hash: String::new(),
                roles: vec!["student".to_string()],
                preferences: Preferences::default(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn token_roundtrip_carries_identity() {
        let config = AuthConfig::new("secret", 60);
        let user = user();
        let token = issue_token(&user, &config).unwrap();
        let claims = decode_token(&token, &config).unwrap();
        assert_eq!(claims.sub, user.id.to_string());
        assert_eq!(claims.email, "student@example.test");
        assert_eq!(claims.roles, vec!["student"]);
        assert_eq!(claims.exp - claims.iat, 60);
    }

    #[test]
    fn expired_and_foreign_tokens_are_rejected() {
        let user = user();
        let expired = issue_token(&user, &AuthConfig::new("secret", -600)).unwrap();
        assert!(matches!(
            decode_token(&expired, &AuthConfig::new("secret", 60)),
            Err(AuthError::TokenExpired)
        ));

        let foreign = issue_token(&user, &AuthConfig::new("other", 60)).unwrap();
        assert!(matches!(
            decode_token(&foreign, &AuthConfig::new("secret", 60)),
            Err(AuthError::TokenInvalid(_))
        ));
    }

    #[tokio::test]
    async fn password_hash_verifies() {
        let hash = hash_password("Sup3rSecret".to_string()).await.unwrap();
        assert!(verify_password("Sup3rSecret".to_string(), hash.clone()).await.unwrap());
        assert!(!verify_password("wrong".to_string(), hash).await.unwrap());
        assert!(verify_password("pw".to_string(), "not-a-hash".to_string())
            .await
            .is_err());
    }

    #[test]
    fn admin_tokens_match_exactly() {
        assert!(tokens_match("s3cret", "s3cret"));
        assert!(!tokens_match("s3cre", "s3cret"));
        assert!(!tokens_match("S3cret", "s3cret"));
        assert!(!tokens_match("", "s3cret"));
    }
}
