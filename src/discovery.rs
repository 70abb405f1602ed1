//! Service discovery
//!
//! Feeds the service registry from etcd. Instance keys have the shape
//! `/<root>/<prefix>/<addr>` with a JSON `{addr, weight}` value. For each
//! configured service the gateway takes a bounded snapshot read at startup,
//! then watches the prefix from the snapshot revision onward until shutdown.
//! Malformed keys or values are logged and skipped so one bad record cannot
//! stall discovery.

use std::sync::Arc;

use etcd_client::{Client, ConnectOptions, Event, EventType, GetOptions, WatchOptions};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::DiscoveryConfig;
use crate::registry::{RegistryEvent, Service, ServiceInstance, ServiceRegistry};
use crate::{Error, Result};

/// Published instance record, as the backends register themselves
#[derive(Debug, Deserialize)]
struct InstanceRecord {
    addr: String,
    #[serde(default)]
    weight: u32,
}

fn service_key_prefix(root: &str, service: &str) -> String {
    format!("/{root}/{service}/")
}

fn addr_to_url(addr: &str) -> String {
    format!("http://{addr}")
}

/// Extract the address segment from an instance key.
///
/// Keys must have exactly four slash-separated segments
/// (`"" / root / prefix / addr`); anything else is malformed.
fn parse_instance_key(key: &str) -> Option<&str> {
    let segments: Vec<&str> = key.split('/').collect();
    match segments.as_slice() {
        ["", _root, _prefix, addr] if !addr.is_empty() => Some(*addr),
        _ => None,
    }
}

/// Decode a published `{addr, weight}` value into an instance
fn parse_instance_value(value: &str) -> Option<ServiceInstance> {
    serde_json::from_str::<InstanceRecord>(value)
        .ok()
        .map(|record| ServiceInstance {
            url: addr_to_url(&record.addr),
            weight: record.weight,
        })
}

/// Connect to the discovery store
pub async fn connect(config: &DiscoveryConfig) -> Result<Client> {
    let options = ConnectOptions::new().with_connect_timeout(config.snapshot_timeout());
    Ok(Client::connect(config.endpoints.clone(), Some(options)).await?)
}

/// Seed the registry with a snapshot of every configured service.
///
/// Registers an entry per configured prefix (possibly with an empty instance
/// list) and returns the snapshot revision to resume watching from, per
/// prefix. Startup-fatal on store errors or a missed deadline.
pub async fn bootstrap(
    client: &mut Client,
    config: &DiscoveryConfig,
    registry: &ServiceRegistry,
) -> Result<Vec<(String, i64)>> {
    let mut revisions = Vec::with_capacity(config.services.len());

    for watched in &config.services {
        let service = Arc::new(Service::new(watched.prefix.clone(), watched.policy));
        let key = service_key_prefix(&config.root, &watched.prefix);

        let response = tokio::time::timeout(
            config.snapshot_timeout(),
            client.get(key.as_str(), Some(GetOptions::new().with_prefix())),
        )
        .await
        .map_err(|_| {
            Error::Internal(format!(
                "discovery snapshot for {} timed out",
                watched.prefix
            ))
        })??;

        for kv in response.kvs() {
            let key = kv.key_str()?;
            let value = kv.value_str()?;
            let Some(_addr) = parse_instance_key(key) else {
                warn!(%key, "skipping malformed instance key");
                continue;
            };
            let Some(instance) = parse_instance_value(value) else {
                warn!(%key, %value, "skipping malformed instance value");
                continue;
            };
            service.upsert_instance(instance);
        }

        let revision = response.header().map_or(0, |h| h.revision());
        info!(
            service = %watched.prefix,
            policy = ?watched.policy,
            instances = service.instances().len(),
            revision,
            "discovered service"
        );

        registry.register(service);
        revisions.push((watched.prefix.clone(), revision));
    }

    Ok(revisions)
}

/// Start one background watcher per service, resuming after the snapshot
pub fn spawn_watchers(
    client: Client,
    config: &DiscoveryConfig,
    registry: Arc<ServiceRegistry>,
    revisions: Vec<(String, i64)>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    revisions
        .into_iter()
        .map(|(prefix, revision)| {
            tokio::spawn(watch_service(
                client.clone(),
                config.root.clone(),
                prefix,
                revision + 1,
                Arc::clone(&registry),
                shutdown.subscribe(),
            ))
        })
        .collect()
}

/// Consume watch events for one service until shutdown.
///
/// Each event batch is applied to the registry atomically.
async fn watch_service(
    mut client: Client,
    root: String,
    prefix: String,
    start_revision: i64,
    registry: Arc<ServiceRegistry>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let key = service_key_prefix(&root, &prefix);
    let options = WatchOptions::new()
        .with_prefix()
        .with_start_revision(start_revision);

    let (mut watcher, mut stream) = match client.watch(key.as_str(), Some(options)).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(service = %prefix, error = %e, "failed to start discovery watch");
            return;
        }
    };

    info!(service = %prefix, start_revision, "watching for instance changes");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = watcher.cancel().await;
                info!(service = %prefix, "discovery watch stopped");
                break;
            }
            message = stream.message() => match message {
                Ok(Some(response)) => {
                    if response.canceled() {
                        warn!(service = %prefix, "discovery watch canceled by server");
                        break;
                    }
                    let events = convert_events(&prefix, response.events());
                    if !events.is_empty() {
                        registry.apply(&events);
                    }
                }
                Ok(None) => {
                    warn!(service = %prefix, "discovery watch stream closed");
                    break;
                }
                Err(e) => {
                    error!(service = %prefix, error = %e, "discovery watch error");
                    break;
                }
            }
        }
    }
}

/// Translate one watch batch into registry events, skipping malformed records
fn convert_events(prefix: &str, events: &[Event]) -> Vec<RegistryEvent> {
    let mut out = Vec::with_capacity(events.len());

    for event in events {
        let Some(kv) = event.kv() else {
            continue;
        };
        let Ok(key) = kv.key_str() else {
            warn!(service = %prefix, "skipping instance key with invalid utf-8");
            continue;
        };
        let Some(addr) = parse_instance_key(key) else {
            warn!(service = %prefix, %key, "skipping malformed instance key");
            continue;
        };

        match event.event_type() {
            EventType::Put => {
                let Ok(value) = kv.value_str() else {
                    warn!(service = %prefix, %key, "skipping instance value with invalid utf-8");
                    continue;
                };
                let Some(instance) = parse_instance_value(value) else {
                    warn!(service = %prefix, %key, %value, "skipping malformed instance value");
                    continue;
                };
                out.push(RegistryEvent::Upsert {
                    prefix: prefix.to_string(),
                    instance,
                });
            }
            EventType::Delete => {
                out.push(RegistryEvent::Remove {
                    prefix: prefix.to_string(),
                    url: addr_to_url(addr),
                });
            }
        }
    }

    out
}
