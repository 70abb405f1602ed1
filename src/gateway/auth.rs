//! Auth gate middleware
//!
//! Two passes run in order on every request. `check_login` validates the
//! bearer token (header first, cookie fallback), consults the revocation
//! store, and attaches the verified claims to the request scope.
//! `check_admin` decides whether the route needs the admin role (by exact
//! `(path, method)` pair, or by `cmd` allow-list on the proxy route) and
//! resolves the caller's role through the bounded user cache, falling back
//! to the user database. Every failure here ends the request.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use cookie::Cookie;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::config::{AdminPair, AuthRulesConfig, PathMethodPair};
use crate::token::UserClaims;
use crate::users::ROLE_ADMIN;
use crate::{Error, HEADER_LOGIN_TOKEN, PROXY_CMD_KEY};

use super::query_param;
use super::router::AppState;

/// Compiled auth rules; lists are O(10) and searched linearly
#[derive(Debug, Clone)]
pub struct AuthRules {
    bypass: Vec<PathMethodPair>,
    admin: Vec<AdminPair>,
}

impl AuthRules {
    /// Build rules from configuration
    #[must_use]
    pub fn from_config(config: &AuthRulesConfig) -> Self {
        Self {
            bypass: config.bypass_pairs.clone(),
            admin: config.admin_pairs.clone(),
        }
    }

    /// Whether the request skips the login check: path matches by prefix,
    /// method exactly.
    #[must_use]
    pub fn is_bypassed(&self, path: &str, method: &Method) -> bool {
        self.bypass.iter().any(|pair| {
            path.starts_with(&pair.path) && method.as_str().eq_ignore_ascii_case(&pair.method)
        })
    }

    /// Whether the request needs the admin role.
    ///
    /// A pair whose path ends in `/*path` matches the proxy route: the
    /// request path must start with the part before the wildcard, the method
    /// is ignored, and the `cmd` query parameter must be on the allow-list.
    /// Every other pair matches exact `(path, method)`.
    #[must_use]
    pub fn admin_required(&self, path: &str, method: &Method, cmd: Option<&str>) -> bool {
        self.admin.iter().any(|pair| {
            if let Some(prefix) = pair.path.strip_suffix("/*path") {
                path.starts_with(prefix)
                    && cmd.is_some_and(|c| pair.cmds.iter().any(|allowed| allowed == c))
            } else {
                pair.path == path && method.as_str().eq_ignore_ascii_case(&pair.method)
            }
        })
    }
}

/// Pull the bearer token from the `Authorization` header, falling back to
/// the login cookie.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
        {
            return Some(token.trim().to_string());
        }
    }

    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for piece in Cookie::split_parse(raw.to_owned()).flatten() {
            if piece.name().eq_ignore_ascii_case(HEADER_LOGIN_TOKEN) {
                return Some(piece.value().to_string());
            }
        }
    }

    None
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": message})),
    )
        .into_response()
}

/// CheckLogin pass
pub async fn check_login(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let method = request.method().clone();

    if state.auth_rules.is_bypassed(&path, &method) {
        return next.run(request).await;
    }

    let Some(token) = extract_token(request.headers()) else {
        warn!(%path, "missing login token");
        return unauthorized("missing login token");
    };

    let claims = match state.tokens.verify(&token) {
        Ok(claims) => claims,
        Err(_) => {
            warn!(%path, "token verification failed");
            return Error::InvalidToken.into_response();
        }
    };

    match state.sessions.is_revoked(&claims.session_id).await {
        Ok(false) => {}
        Ok(true) => {
            debug!(user_id = claims.user_id, "session revoked");
            return Error::SessionRevoked.into_response();
        }
        Err(e) => {
            error!(error = %e, "session check failed");
            return unauthorized("session check failed");
        }
    }

    match state.sessions.token_version(claims.user_id).await {
        Ok(version) if claims.token_version >= version => {}
        Ok(_) => {
            debug!(user_id = claims.user_id, "token version superseded");
            return Error::InvalidToken.into_response();
        }
        Err(e) => {
            error!(error = %e, "token version check failed");
            return unauthorized("session check failed");
        }
    }

    request.extensions_mut().insert(claims);
    next.run(request).await
}

/// CheckAdmin pass; runs after CheckLogin
pub async fn check_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let method = request.method().clone();
    let cmd = query_param(request.uri().query(), PROXY_CMD_KEY);

    if !state
        .auth_rules
        .admin_required(&path, &method, cmd.as_deref())
    {
        return next.run(request).await;
    }

    // An admin route reached without a login pass can only mean a
    // misconfigured bypass; deny.
    let Some(claims) = request.extensions().get::<UserClaims>().cloned() else {
        warn!(%path, "admin route reached without verified claims");
        return unauthorized("missing login token");
    };

    let role = match state.user_cache.get(claims.user_id) {
        Some(entry) => entry.role,
        None => match state.users.role_entry(claims.user_id).await {
            Ok(Some(entry)) => {
                let role = entry.role;
                state.user_cache.put(claims.user_id, entry);
                role
            }
            Ok(None) => {
                error!(user_id = claims.user_id, "user vanished from directory");
                return Error::Internal("user lookup failed".to_string()).into_response();
            }
            Err(e) => {
                error!(user_id = claims.user_id, error = %e, "user lookup failed");
                return Error::Internal("user lookup failed".to_string()).into_response();
            }
        },
    };

    if role != ROLE_ADMIN {
        debug!(user_id = claims.user_id, role, %path, "admin check rejected");
        return Error::Forbidden.into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn rules(bypass: Vec<(&str, &str)>, admin: Vec<AdminPair>) -> AuthRules {
        AuthRules {
            bypass: bypass
                .into_iter()
                .map(|(path, method)| PathMethodPair {
                    path: path.to_string(),
                    method: method.to_string(),
                })
                .collect(),
            admin,
        }
    }

    fn admin_pair(path: &str, method: &str, cmds: &[&str]) -> AdminPair {
        AdminPair {
            path: path.to_string(),
            method: method.to_string(),
            cmds: cmds.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn bypass_matches_path_prefix_and_exact_method() {
        let rules = rules(vec![("/auth/login", "POST"), ("/health", "GET")], vec![]);

        assert!(rules.is_bypassed("/auth/login", &Method::POST));
        // prefix match on the path
        assert!(rules.is_bypassed("/auth/login/v2", &Method::POST));
        // method is exact
        assert!(!rules.is_bypassed("/auth/login", &Method::GET));
        assert!(!rules.is_bypassed("/auth/info", &Method::GET));
        assert!(rules.is_bypassed("/health", &Method::GET));
    }

    #[test]
    fn admin_exact_pair_matches_path_and_method() {
        let rules = rules(vec![], vec![admin_pair("/auth/info", "GET", &[])]);

        assert!(rules.admin_required("/auth/info", &Method::GET, None));
        assert!(!rules.admin_required("/auth/info", &Method::POST, None));
        assert!(!rules.admin_required("/auth/login", &Method::GET, None));
    }

    #[test]
    fn admin_proxy_pair_gates_on_cmd_allow_list() {
        let rules = rules(
            vec![],
            vec![admin_pair("/api/*path", "", &["rejudge", "ban_user"])],
        );

        assert!(rules.admin_required("/api/judge", &Method::POST, Some("rejudge")));
        // method is a wildcard on the proxy route
        assert!(rules.admin_required("/api/judge", &Method::GET, Some("ban_user")));
        assert!(!rules.admin_required("/api/judge", &Method::POST, Some("submit")));
        assert!(!rules.admin_required("/api/judge", &Method::POST, None));
        assert!(!rules.admin_required("/auth/info", &Method::GET, Some("rejudge")));
    }

    #[test]
    fn token_comes_from_bearer_header_first() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer header-token"),
        );
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("X-JWT-Token=cookie-token"),
        );

        assert_eq!(extract_token(&headers), Some("header-token".to_string()));
    }

    #[test]
    fn token_falls_back_to_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; X-JWT-Token=cookie-token"),
        );

        assert_eq!(extract_token(&headers), Some("cookie-token".to_string()));
    }

    #[test]
    fn malformed_authorization_header_yields_no_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_token(&headers), None);

        headers.clear();
        assert_eq!(extract_token(&headers), None);
    }
}
