//! User directory
//!
//! Read-only access to the shared user database. The gateway never writes
//! user rows; it authenticates logins, serves `/auth/info`, and fetches the
//! role fields behind the admin check. Queries select only the columns they
//! need.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};

use crate::config::DatabaseConfig;
use crate::user_cache::CachedUser;
use crate::{Error, Result};

/// Role code granting access to admin-gated routes
pub const ROLE_ADMIN: i8 = 2;

/// Status code of an account allowed to log in
pub const USER_STATUS_NORMAL: i8 = 1;

/// Fields served by `/auth/info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Login name
    pub username: String,
    /// Display name
    pub realname: String,
    /// Role code
    pub role: i8,
    /// Account status code
    pub status: i8,
}

/// Lookup seam over the user database
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Verify credentials for an account in normal status.
    ///
    /// `Ok(None)` means unknown user or wrong password; errors are database
    /// faults only.
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<u64>>;

    /// Profile fields for `/auth/info`
    async fn info(&self, user_id: u64) -> Result<Option<UserInfo>>;

    /// Role fields for the admin check (feeds the user cache)
    async fn role_entry(&self, user_id: u64) -> Result<Option<CachedUser>>;
}

/// MySQL-backed [`UserDirectory`]
pub struct SqlUserDirectory {
    pool: MySqlPool,
}

impl SqlUserDirectory {
    /// Connect a pool with the configured limits
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(Duration::from_secs(config.conn_max_lifetime_minutes * 60))
            .idle_timeout(Duration::from_secs(config.conn_max_idle_minutes * 60))
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: u64,
    password: String,
}

#[async_trait]
impl UserDirectory for SqlUserDirectory {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<u64>> {
        let row: Option<CredentialRow> =
            sqlx::query_as("SELECT id, password FROM user WHERE username = ? AND status = ?")
                .bind(username)
                .bind(USER_STATUS_NORMAL)
                .fetch_optional(&self.pool)
                .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        // bcrypt verification pins a CPU for tens of milliseconds; keep it
        // off the async worker threads.
        let password = password.to_string();
        let verified =
            tokio::task::spawn_blocking(move || bcrypt::verify(password, &row.password))
                .await
                .map_err(|e| Error::Internal(e.to_string()))?
                .unwrap_or(false);

        Ok(verified.then_some(row.id))
    }

    async fn info(&self, user_id: u64) -> Result<Option<UserInfo>> {
        let row: Option<(String, String, i8, i8)> =
            sqlx::query_as("SELECT username, realname, role, status FROM user WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(username, realname, role, status)| UserInfo {
            username,
            realname,
            role,
            status,
        }))
    }

    async fn role_entry(&self, user_id: u64) -> Result<Option<CachedUser>> {
        let row: Option<(String, String, i8)> =
            sqlx::query_as("SELECT username, realname, role FROM user WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(username, realname, role)| CachedUser {
            username,
            realname,
            role,
        }))
    }
}
