//! Route table and auth endpoints

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router, middleware};
use cookie::Cookie;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

use crate::registry::ServiceRegistry;
use crate::session::RevocationStore;
use crate::token::{TokenCodec, UserClaims};
use crate::user_cache::UserCache;
use crate::users::UserDirectory;
use crate::{Error, HEADER_LOGIN_TOKEN, LOGIN_TOKEN_COOKIE};

use super::auth::{AuthRules, check_admin, check_login};
use super::proxy::proxy_handler;

/// Shared application state
pub struct AppState {
    /// Discovered services and their instances
    pub registry: Arc<ServiceRegistry>,
    /// Shared revocation / token-version store
    pub sessions: Arc<dyn RevocationStore>,
    /// User database access
    pub users: Arc<dyn UserDirectory>,
    /// Bounded role cache for the admin check
    pub user_cache: Arc<UserCache>,
    /// Token sign/verify
    pub tokens: Arc<TokenCodec>,
    /// Bypass and admin pair rules
    pub auth_rules: AuthRules,
    /// Upstream HTTP client for the reverse proxy
    pub http: reqwest::Client,
    /// Access token lifetime
    pub token_lifetime: Duration,
    /// Revocation TTL (refresh lifetime)
    pub revocation_ttl: Duration,
}

/// Create the router: CORS first, then the two auth passes, then routes
pub fn create_router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/auth/login", post(login_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/info", get(info_handler))
        .route("/api/{*path}", any(proxy_handler))
        .route("/health", get(health_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            check_admin,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            check_login,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `POST /auth/login` body
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Login name
    pub username: String,
    /// Plaintext password, verified against the stored bcrypt hash
    pub password: String,
}

fn login_token_header() -> HeaderName {
    HeaderName::from_static(HEADER_LOGIN_TOKEN)
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "login bind failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.body_text()})),
            )
                .into_response();
        }
    };

    let user_id = match state.users.authenticate(&req.username, &req.password).await {
        Ok(Some(id)) => id,
        Ok(None) => {
            warn!(username = %req.username, "login rejected");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid username or password"})),
            )
                .into_response();
        }
        Err(e) => {
            error!(username = %req.username, error = %e, "login lookup failed");
            return Error::Internal("login failed".to_string()).into_response();
        }
    };

    let token_version = match state.sessions.token_version(user_id).await {
        Ok(version) => version,
        Err(e) => {
            error!(user_id, error = %e, "token version read failed");
            return Error::Internal("login failed".to_string()).into_response();
        }
    };

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let claims = UserClaims::new(
        user_id,
        Uuid::new_v4().to_string(),
        user_agent,
        token_version,
        state.token_lifetime,
    );
    let token = match state.tokens.sign(&claims) {
        Ok(token) => token,
        Err(e) => {
            error!(user_id, error = %e, "token signing failed");
            return e.into_response();
        }
    };

    let cookie = Cookie::build((LOGIN_TOKEN_COOKIE, token.clone()))
        .path("/")
        .http_only(true)
        .max_age(cookie::time::Duration::seconds(
            state.token_lifetime.as_secs() as i64,
        ))
        .build();

    let mut response =
        (StatusCode::OK, Json(json!({"message": "login success"}))).into_response();
    let header_map = response.headers_mut();
    header_map.insert(
        login_token_header(),
        HeaderValue::from_str(&token).expect("compact token is a valid header value"),
    );
    header_map.append(
        header::SET_COOKIE,
        HeaderValue::from_str(&cookie.to_string()).expect("cookie serializes to ascii"),
    );
    response
}

async fn logout_handler(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<UserClaims>,
) -> Response {
    if let Err(e) = state
        .sessions
        .revoke(&claims.session_id, state.revocation_ttl)
        .await
    {
        error!(user_id = claims.user_id, error = %e, "logout revoke failed");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "logout failed"})),
        )
            .into_response();
    }

    state.user_cache.remove(claims.user_id);

    let removal = Cookie::build((LOGIN_TOKEN_COOKIE, ""))
        .path("/")
        .http_only(true)
        .max_age(cookie::time::Duration::ZERO)
        .build();

    let mut response =
        (StatusCode::OK, Json(json!({"message": "logout success"}))).into_response();
    let header_map = response.headers_mut();
    header_map.insert(login_token_header(), HeaderValue::from_static(""));
    header_map.append(
        header::SET_COOKIE,
        HeaderValue::from_str(&removal.to_string()).expect("cookie serializes to ascii"),
    );
    response
}

async fn info_handler(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<UserClaims>,
) -> Response {
    match state.users.info(claims.user_id).await {
        Ok(Some(info)) => (StatusCode::OK, Json(info)).into_response(),
        Ok(None) => {
            error!(user_id = claims.user_id, "user vanished from directory");
            Error::Internal("user lookup failed".to_string()).into_response()
        }
        Err(e) => {
            error!(user_id = claims.user_id, error = %e, "user lookup failed");
            Error::Internal("user lookup failed".to_string()).into_response()
        }
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}
