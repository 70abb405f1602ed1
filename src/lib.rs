//! Online-judge API gateway
//!
//! Sits in front of a fleet of judge backend services and provides:
//!
//! - **Auth gate**: HS512 bearer tokens with server-side session revocation
//!   and an admin check backed by a bounded user cache
//! - **Dynamic service registry**: backend instances discovered from etcd
//!   (startup snapshot + prefix watch)
//! - **Load balancing**: round-robin, random, weighted-random and
//!   weighted-round-robin selection per service
//! - **Reverse proxy**: `cmd`-driven path rewriting with correlation headers,
//!   streaming bodies end to end

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod balancer;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod session;
pub mod token;
pub mod user_cache;
pub mod users;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Service name injected into `X-Forwarded-By` and `X-Proxy-By`
pub const GATEWAY_SERVICE_NAME: &str = "OnlineJudge-Gateway";

/// Query parameter naming the backend operation; consumed during proxying
pub const PROXY_CMD_KEY: &str = "cmd";

/// Header carrying the gateway identity on proxied requests
pub const HEADER_FORWARDED_BY: &str = "x-forwarded-by";
/// Header carrying a fresh correlation id per proxied request
pub const HEADER_REQUEST_ID: &str = "x-request-id";
/// Header carrying the authenticated caller's user id
pub const HEADER_USER_ID: &str = "x-user-id";
/// Header stamped onto proxied responses
pub const HEADER_PROXY_BY: &str = "x-proxy-by";
/// Header (and cookie name) carrying the signed login token
pub const HEADER_LOGIN_TOKEN: &str = "x-jwt-token";
/// Canonical cookie spelling of [`HEADER_LOGIN_TOKEN`]; cookie names are
/// case-sensitive where header names are not
pub const LOGIN_TOKEN_COOKIE: &str = "X-JWT-Token";

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
