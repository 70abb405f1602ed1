//! Shared fixtures: in-memory store implementations and a gateway harness
//!
//! The gateway's storage seams (`RevocationStore`, `UserDirectory`) are
//! traits, so the full router (CORS, both auth passes, the proxy) can be
//! exercised against in-process state and a local backend listener, with no
//! Redis/MySQL/etcd running.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Router;
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;

use oj_gateway::config::{AdminPair, AuthRulesConfig};
use oj_gateway::gateway::auth::AuthRules;
use oj_gateway::gateway::router::{AppState, create_router};
use oj_gateway::gateway::server::build_cors;
use oj_gateway::registry::ServiceRegistry;
use oj_gateway::session::RevocationStore;
use oj_gateway::token::{TokenCodec, UserClaims};
use oj_gateway::user_cache::{CachedUser, UserCache};
use oj_gateway::users::{USER_STATUS_NORMAL, UserDirectory, UserInfo};
use oj_gateway::{Result, config::CorsConfig};

pub const SIGNING_KEY: &[u8] = b"test-signing-key-test-signing-key";
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(30 * 60);
pub const REVOCATION_TTL: Duration = Duration::from_secs(60 * 60);

// ── In-memory revocation store ─────────────────────────────────────────

#[derive(Default)]
pub struct MemorySessionStore {
    revoked: Mutex<HashSet<String>>,
    versions: Mutex<HashMap<u64, i64>>,
}

#[async_trait]
impl RevocationStore for MemorySessionStore {
    async fn is_revoked(&self, session_id: &str) -> Result<bool> {
        Ok(self.revoked.lock().contains(session_id))
    }

    async fn revoke(&self, session_id: &str, _ttl: Duration) -> Result<()> {
        self.revoked.lock().insert(session_id.to_string());
        Ok(())
    }

    async fn token_version(&self, user_id: u64) -> Result<i64> {
        Ok(self.versions.lock().get(&user_id).copied().unwrap_or(0))
    }

    async fn bump_token_version(&self, user_id: u64) -> Result<i64> {
        let mut versions = self.versions.lock();
        let version = versions.entry(user_id).or_insert(0);
        *version += 1;
        Ok(*version)
    }
}

// ── In-memory user directory ───────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryUser {
    pub id: u64,
    pub username: String,
    pub realname: String,
    pub password_hash: String,
    pub role: i8,
    pub status: i8,
}

pub fn user(id: u64, username: &str, password: &str, role: i8) -> MemoryUser {
    MemoryUser {
        id,
        username: username.to_string(),
        realname: username.to_uppercase(),
        // minimum cost keeps the fixture fast
        password_hash: bcrypt::hash(password, 4).unwrap(),
        role,
        status: USER_STATUS_NORMAL,
    }
}

pub struct MemoryUserDirectory {
    users: Vec<MemoryUser>,
}

impl MemoryUserDirectory {
    pub fn new(users: Vec<MemoryUser>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<u64>> {
        let found = self
            .users
            .iter()
            .find(|u| u.username == username && u.status == USER_STATUS_NORMAL);
        let Some(found) = found else {
            return Ok(None);
        };
        let verified = bcrypt::verify(password, &found.password_hash).unwrap_or(false);
        Ok(verified.then_some(found.id))
    }

    async fn info(&self, user_id: u64) -> Result<Option<UserInfo>> {
        Ok(self.users.iter().find(|u| u.id == user_id).map(|u| UserInfo {
            username: u.username.clone(),
            realname: u.realname.clone(),
            role: u.role,
            status: u.status,
        }))
    }

    async fn role_entry(&self, user_id: u64) -> Result<Option<CachedUser>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.id == user_id)
            .map(|u| CachedUser {
                username: u.username.clone(),
                realname: u.realname.clone(),
                role: u.role,
            }))
    }
}

// ── Capturing backend ──────────────────────────────────────────────────

/// What the fake backend saw for the last proxied request
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone, Default)]
pub struct Capture {
    last: Arc<Mutex<Option<CapturedRequest>>>,
}

impl Capture {
    pub fn take(&self) -> Option<CapturedRequest> {
        self.last.lock().take()
    }
}

async fn capture_handler(State(capture): State<Capture>, request: Request) -> impl IntoResponse {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    *capture.last.lock() = Some(CapturedRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(ToString::to_string),
        headers: parts.headers,
        body: bytes,
    });
    Json(json!({"ok": true}))
}

/// Spawn a backend that records every request and answers `{"ok":true}`
pub async fn spawn_backend() -> (SocketAddr, Capture) {
    let capture = Capture::default();
    let app = Router::new()
        .fallback(capture_handler)
        .with_state(capture.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, capture)
}

// ── Gateway harness ────────────────────────────────────────────────────

pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    pub sessions: Arc<MemorySessionStore>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Sign a token for the given user, embedding the store's current version
    pub async fn token_for(&self, user_id: u64) -> String {
        let version = self.sessions.token_version(user_id).await.unwrap();
        let claims = UserClaims::new(
            user_id,
            uuid::Uuid::new_v4().to_string(),
            "test-agent",
            version,
            TOKEN_LIFETIME,
        );
        self.state.tokens.sign(&claims).unwrap()
    }
}

/// Boot a full gateway over in-memory stores and return its address
pub async fn spawn_gateway(
    registry: Arc<ServiceRegistry>,
    users: MemoryUserDirectory,
    admin_pairs: Vec<AdminPair>,
) -> TestGateway {
    let rules = AuthRulesConfig {
        admin_pairs,
        ..AuthRulesConfig::default()
    };
    spawn_gateway_with_rules(registry, users, rules).await
}

/// Same as [`spawn_gateway`] but with full control over the auth rules
pub async fn spawn_gateway_with_rules(
    registry: Arc<ServiceRegistry>,
    users: MemoryUserDirectory,
    rules: AuthRulesConfig,
) -> TestGateway {
    let sessions = Arc::new(MemorySessionStore::default());

    let state = Arc::new(AppState {
        registry,
        sessions: Arc::clone(&sessions) as Arc<dyn RevocationStore>,
        users: Arc::new(users),
        user_cache: Arc::new(UserCache::new(64)),
        tokens: Arc::new(TokenCodec::new(SIGNING_KEY)),
        auth_rules: AuthRules::from_config(&rules),
        http: reqwest::Client::new(),
        token_lifetime: TOKEN_LIFETIME,
        revocation_ttl: REVOCATION_TTL,
    });

    let app = create_router(Arc::clone(&state), build_cors(&CorsConfig::default()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestGateway {
        addr,
        state,
        sessions,
    }
}
