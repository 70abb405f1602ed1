//! Reverse proxy handler
//!
//! Resolves `/api/*path` requests to a discovered backend instance and
//! streams the exchange both ways. The logical operation is named by the
//! `cmd` query parameter: the outgoing path becomes `/<cmd>` and the
//! parameter is scrubbed from the outgoing query. Requests without `cmd`
//! are forwarded unchanged. A failed upstream call is surfaced as 502; the
//! instance stays in rotation, since removal happens only through discovery
//! delete events.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Uri, header};
use axum::response::{IntoResponse, Response};
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::token::UserClaims;
use crate::{
    Error, GATEWAY_SERVICE_NAME, HEADER_FORWARDED_BY, HEADER_PROXY_BY, HEADER_REQUEST_ID,
    HEADER_USER_ID, PROXY_CMD_KEY,
};

use super::query_param;
use super::router::AppState;

/// Hop-by-hop headers are a property of the gateway↔peer connection and
/// never travel further.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// `ANY /api/{*path}`
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    request: Request,
) -> Response {
    let service_path = path.trim_start_matches('/');

    // The auth gate attaches claims on every non-bypassed route; their
    // absence here is a wiring bug, not a client error.
    let Some(claims) = request.extensions().get::<UserClaims>().cloned() else {
        error!(service_path, "user claims not found in request scope");
        return Error::Internal("user claims not found in request scope".to_string())
            .into_response();
    };

    let Some((service_name, instance)) = state.registry.select_for(service_path) else {
        warn!(service_path, "service not found");
        return Error::ServiceNotFound(service_path.to_string()).into_response();
    };

    let Some(instance) = instance else {
        warn!(service = %service_name, "no instance available");
        return Error::NoInstance(service_name).into_response();
    };

    let target = match build_target_url(&instance.url, request.uri()) {
        Ok(target) => target,
        Err(e) => {
            error!(url = %instance.url, error = %e, "parse target url failed");
            return e.into_response();
        }
    };

    let (parts, body) = request.into_parts();
    let headers = proxied_request_headers(&parts.headers, claims.user_id);

    info!(
        method = %parts.method,
        target = %target,
        user_id = claims.user_id,
        "proxying request"
    );

    let upstream = state
        .http
        .request(parts.method, target.clone())
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            error!(target = %target, error = %e, "proxy error");
            return Error::Upstream(e.to_string()).into_response();
        }
    };

    let status = upstream.status();
    let mut response_headers = strip_hop_by_hop(upstream.headers());
    response_headers.insert(
        HeaderName::from_static(HEADER_PROXY_BY),
        HeaderValue::from_static(GATEWAY_SERVICE_NAME),
    );

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

/// Build the outgoing URL from the selected instance and the inbound URI.
///
/// With `cmd=<op>` present the outgoing path is `/<op>` and `cmd` is dropped
/// from the query; without it the inbound path and query pass through
/// unchanged (the downstream may still handle it).
fn build_target_url(instance_url: &str, uri: &Uri) -> crate::Result<Url> {
    let mut target = Url::parse(instance_url)
        .map_err(|e| Error::Internal(format!("parse target url: {e}")))?;

    match query_param(uri.query(), PROXY_CMD_KEY) {
        Some(op) => {
            target.set_path(&format!("/{op}"));

            let query = uri.query().unwrap_or_default();
            let remaining: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
                .filter(|(key, _)| key != PROXY_CMD_KEY)
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();
            if remaining.is_empty() {
                target.set_query(None);
            } else {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(remaining)
                    .finish();
                target.set_query(Some(&encoded));
            }
        }
        None => {
            warn!(path = uri.path(), "request missing cmd parameter");
            target.set_path(uri.path());
            target.set_query(uri.query());
        }
    }

    Ok(target)
}

/// Inbound headers minus hop-by-hop and `Host`, plus the gateway's
/// correlation headers.
fn proxied_request_headers(inbound: &HeaderMap, user_id: u64) -> HeaderMap {
    let mut headers = strip_hop_by_hop(inbound);
    headers.remove(header::HOST);

    headers.insert(
        HeaderName::from_static(HEADER_FORWARDED_BY),
        HeaderValue::from_static(GATEWAY_SERVICE_NAME),
    );
    headers.insert(
        HeaderName::from_static(HEADER_REQUEST_ID),
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .expect("canonical uuid is a valid header value"),
    );
    headers.insert(
        HeaderName::from_static(HEADER_USER_ID),
        HeaderValue::from_str(&user_id.to_string())
            .expect("decimal integer is a valid header value"),
    );

    headers
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP_HEADERS {
        out.remove(name);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cmd_rewrites_path_and_scrubs_query() {
        let uri: Uri = "/api/foo?cmd=bar&x=1".parse().unwrap();
        let target = build_target_url("http://h1:9", &uri).unwrap();

        assert_eq!(target.path(), "/bar");
        assert_eq!(target.query(), Some("x=1"));
        assert_eq!(target.as_str(), "http://h1:9/bar?x=1");
    }

    #[test]
    fn cmd_alone_leaves_no_query() {
        let uri: Uri = "/api/judge?cmd=submit".parse().unwrap();
        let target = build_target_url("http://h1:9", &uri).unwrap();

        assert_eq!(target.path(), "/submit");
        assert_eq!(target.query(), None);
    }

    #[test]
    fn missing_cmd_forwards_path_unchanged() {
        let uri: Uri = "/api/judge/status?x=1".parse().unwrap();
        let target = build_target_url("http://h1:9", &uri).unwrap();

        assert_eq!(target.path(), "/api/judge/status");
        assert_eq!(target.query(), Some("x=1"));
    }

    #[test]
    fn unparseable_instance_url_is_internal_error() {
        let uri: Uri = "/api/judge?cmd=submit".parse().unwrap();
        let err = build_target_url("::not a url::", &uri).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn correlation_headers_are_injected() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let headers = proxied_request_headers(&inbound, 42);

        assert_eq!(
            headers.get(HEADER_FORWARDED_BY).unwrap(),
            GATEWAY_SERVICE_NAME
        );
        assert_eq!(headers.get(HEADER_USER_ID).unwrap(), "42");
        // request id must parse as a UUID
        let request_id = headers.get(HEADER_REQUEST_ID).unwrap().to_str().unwrap();
        assert!(Uuid::parse_str(request_id).is_ok());
        // untouched headers pass through
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "application/json");
    }

    #[test]
    fn each_request_gets_a_fresh_request_id() {
        let inbound = HeaderMap::new();
        let first = proxied_request_headers(&inbound, 1);
        let second = proxied_request_headers(&inbound, 1);
        assert_ne!(
            first.get(HEADER_REQUEST_ID).unwrap(),
            second.get(HEADER_REQUEST_ID).unwrap()
        );
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        inbound.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        inbound.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        inbound.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        let headers = proxied_request_headers(&inbound, 7);

        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::ACCEPT).is_some());
    }
}
