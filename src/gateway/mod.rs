//! HTTP layer: auth gate, reverse proxy, routing and server wiring

pub mod auth;
pub mod proxy;
pub mod router;
pub mod server;

pub use server::Gateway;

/// First value of a query parameter, decoded
pub(crate) fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}
