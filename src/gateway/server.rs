//! Gateway server wiring

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::{Config, CorsConfig};
use crate::discovery;
use crate::registry::ServiceRegistry;
use crate::session::RedisSessionStore;
use crate::token::TokenCodec;
use crate::user_cache::UserCache;
use crate::users::SqlUserDirectory;
use crate::{Error, Result};

use super::auth::AuthRules;
use super::router::{AppState, create_router};

/// Gateway server
pub struct Gateway {
    config: Config,
}

impl Gateway {
    /// Create a gateway from a loaded configuration
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self { config })
    }

    /// Connect the backing stores, seed the registry, and serve until a
    /// shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error when a backing store cannot be reached, the
    /// discovery snapshot misses its deadline, or the listener cannot bind.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let sessions = Arc::new(RedisSessionStore::connect(&self.config.session_store.url).await?);
        info!(url = %self.config.session_store.url, "Session store connected");

        let users = Arc::new(SqlUserDirectory::connect(&self.config.database).await?);
        info!("User database connected");

        let mut etcd = discovery::connect(&self.config.discovery).await?;
        let registry = Arc::new(ServiceRegistry::new());
        let revisions =
            discovery::bootstrap(&mut etcd, &self.config.discovery, &registry).await?;
        let watchers = discovery::spawn_watchers(
            etcd,
            &self.config.discovery,
            Arc::clone(&registry),
            revisions,
            &shutdown_tx,
        );

        let http = reqwest::Client::builder()
            .timeout(self.config.proxy.upstream_timeout())
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;

        let state = Arc::new(AppState {
            registry: Arc::clone(&registry),
            sessions,
            users,
            user_cache: Arc::new(UserCache::new(self.config.user_cache.capacity)),
            tokens: Arc::new(TokenCodec::new(self.config.token.signing_key.as_bytes())),
            auth_rules: AuthRules::from_config(&self.config.auth),
            http,
            token_lifetime: self.config.token.lifetime(),
            revocation_ttl: self.config.token.refresh_lifetime(),
        });

        let app = create_router(state, build_cors(&self.config.cors));

        let listener = TcpListener::bind(addr).await?;
        info!(
            host = %self.config.server.host,
            port = self.config.server.port,
            services = ?registry.prefixes(),
            "Listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        // The shutdown broadcast has gone out; let the watchers drain.
        for watcher in watchers {
            let _ = watcher.await;
        }

        Ok(())
    }
}

/// Translate the CORS configuration into a [`CorsLayer`]
pub fn build_cors(config: &CorsConfig) -> CorsLayer {
    let mut cors = CorsLayer::new();

    let wildcard_origin = config.allow_origins.iter().any(|o| o == "*");
    if wildcard_origin {
        cors = cors.allow_origin(Any);
    } else {
        let origins: Vec<HeaderValue> = config
            .allow_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors = cors.allow_origin(origins);
    }

    if config.allow_methods.iter().any(|m| m == "*") {
        cors = cors.allow_methods(Any);
    } else {
        let methods: Vec<Method> = config
            .allow_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        cors = cors.allow_methods(methods);
    }

    if config.allow_headers.iter().any(|h| h == "*") {
        cors = cors.allow_headers(Any);
    } else {
        let headers: Vec<axum::http::HeaderName> = config
            .allow_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        cors = cors.allow_headers(headers);
    }

    let expose: Vec<axum::http::HeaderName> = config
        .expose_headers
        .iter()
        .filter(|h| *h != "*")
        .filter_map(|h| h.parse().ok())
        .collect();
    if !expose.is_empty() {
        cors = cors.expose_headers(expose);
    }

    if config.allow_credentials {
        // Credentials are incompatible with wildcard origins; dropping the
        // flag beats refusing every preflight at runtime.
        if wildcard_origin {
            warn!("cors.allow_credentials ignored because allow_origins is a wildcard");
        } else {
            cors = cors.allow_credentials(true);
        }
    }

    cors.max_age(std::time::Duration::from_secs(config.max_age_secs))
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
