//! Session revocation store
//!
//! A thin wrapper over a shared key-value store with TTL. Revocations are
//! keyed by session id and expire after the refresh lifetime, so a revocation
//! always outlives any access token signed before it. The store also holds a
//! per-user token version; bumping it invalidates every outstanding token
//! that embeds an older version.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::Result;

fn ssid_key(session_id: &str) -> String {
    format!("users:ssid:{session_id}")
}

fn version_key(user_id: u64) -> String {
    format!("users:version:{user_id}")
}

/// Pluggable revocation store shared by all gateway nodes
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Whether the session id is present in the revocation set
    async fn is_revoked(&self, session_id: &str) -> Result<bool>;

    /// Record a revocation; idempotent, expires after `ttl`
    async fn revoke(&self, session_id: &str, ttl: Duration) -> Result<()>;

    /// Current token version for the user; missing key reads as 0
    async fn token_version(&self, user_id: u64) -> Result<i64>;

    /// Increment the user's token version, invalidating older tokens
    async fn bump_token_version(&self, user_id: u64) -> Result<i64>;
}

/// Redis-backed [`RevocationStore`]
pub struct RedisSessionStore {
    conn: ConnectionManager,
}

impl RedisSessionStore {
    /// Connect and build a managed connection
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl RevocationStore for RedisSessionStore {
    async fn is_revoked(&self, session_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let revoked: bool = conn.exists(ssid_key(session_id)).await?;
        Ok(revoked)
    }

    async fn revoke(&self, session_id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(ssid_key(session_id), "", ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn token_version(&self, user_id: u64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let version: Option<i64> = conn.get(version_key(user_id)).await?;
        Ok(version.unwrap_or(0))
    }

    async fn bump_token_version(&self, user_id: u64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let version: i64 = conn.incr(version_key(user_id), 1).await?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_embed_their_identifier() {
        assert_eq!(
            ssid_key("4f7c2b8e-9a31-4d5c-8e61-0a9b7c3d2f10"),
            "users:ssid:4f7c2b8e-9a31-4d5c-8e61-0a9b7c3d2f10"
        );
        assert_eq!(version_key(42), "users:version:42");
    }
}
