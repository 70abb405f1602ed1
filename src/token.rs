//! Signed bearer tokens
//!
//! Compact three-part tokens signed with HMAC-SHA-512. A token carries the
//! caller's identity, the random session id used for server-side revocation,
//! and the token version that lets a user mass-invalidate outstanding tokens.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Verified claims carried by a login token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserClaims {
    /// Authenticated user id
    pub user_id: u64,
    /// Session id (UUID v4, canonical ASCII form)
    pub session_id: String,
    /// User agent captured at login
    pub user_agent: String,
    /// Version at sign time; older than the stored version ⇒ rejected
    pub token_version: i64,
    /// Absolute expiry, seconds since the epoch
    pub exp: i64,
}

impl UserClaims {
    /// Build claims expiring `lifetime` from now
    #[must_use]
    pub fn new(
        user_id: u64,
        session_id: impl Into<String>,
        user_agent: impl Into<String>,
        token_version: i64,
        lifetime: Duration,
    ) -> Self {
        Self {
            user_id,
            session_id: session_id.into(),
            user_agent: user_agent.into(),
            token_version,
            exp: Utc::now().timestamp() + lifetime.as_secs() as i64,
        }
    }
}

/// HS512 sign/verify for [`UserClaims`]
pub struct TokenCodec {
    header: Header,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenCodec {
    /// Create a codec over the configured signing key
    #[must_use]
    pub fn new(signing_key: &[u8]) -> Self {
        Self {
            header: Header::new(Algorithm::HS512),
            encoding: EncodingKey::from_secret(signing_key),
            decoding: DecodingKey::from_secret(signing_key),
            validation: Validation::new(Algorithm::HS512),
        }
    }

    /// Sign claims into a compact token string
    pub fn sign(&self, claims: &UserClaims) -> Result<String> {
        encode(&self.header, claims, &self.encoding).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Verify signature, expiry and shape; any failure is [`Error::InvalidToken`]
    pub fn verify(&self, token: &str) -> Result<UserClaims> {
        decode::<UserClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| Error::InvalidToken)
    }
}
