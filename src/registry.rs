//! Service registry
//!
//! Maps a service prefix (the discovery-store key segment under the root) to
//! its instance set and selection policy. Readers resolve services under a
//! shared read lock; the discovery watcher applies each event batch under the
//! write lock so a request sees either the pre- or post-batch state, never a
//! partial one. Each service carries its own lock over the instance list and
//! the selection cursor.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::balancer::{self, LoadBalancePolicy};

/// One backend origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Origin URL, e.g. `http://10.0.0.7:8081`
    pub url: String,
    /// Relative weight; consulted only by the weighted policies
    pub weight: u32,
}

#[derive(Debug, Default)]
struct ServiceState {
    instances: Vec<ServiceInstance>,
    cursor: u64,
}

/// A discovered service: ordered instance list plus selection policy
pub struct Service {
    name: String,
    policy: LoadBalancePolicy,
    state: Mutex<ServiceState>,
}

impl Service {
    /// Create a service with an empty instance list
    #[must_use]
    pub fn new(name: impl Into<String>, policy: LoadBalancePolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            state: Mutex::new(ServiceState::default()),
        }
    }

    /// Service name (the discovery prefix)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Selection policy
    #[must_use]
    pub fn policy(&self) -> LoadBalancePolicy {
        self.policy
    }

    /// Select one instance per the service policy, or `None` when empty
    pub fn select(&self) -> Option<ServiceInstance> {
        let mut state = self.state.lock();
        let ServiceState { instances, cursor } = &mut *state;
        balancer::select(self.policy, instances, cursor)
    }

    /// Replace the instance with the same URL in place (its slot is
    /// preserved), or append when the URL is new.
    pub fn upsert_instance(&self, instance: ServiceInstance) {
        let mut state = self.state.lock();
        match state.instances.iter_mut().find(|i| i.url == instance.url) {
            Some(slot) => *slot = instance,
            None => state.instances.push(instance),
        }
    }

    /// Remove the instance with the given URL, if present
    pub fn remove_instance(&self, url: &str) {
        let mut state = self.state.lock();
        state.instances.retain(|i| i.url != url);
    }

    /// Snapshot of the current instance list
    #[must_use]
    pub fn instances(&self) -> Vec<ServiceInstance> {
        self.state.lock().instances.clone()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("instances", &self.instances())
            .finish()
    }
}

/// A change produced by the discovery watcher
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// Instance published (new or replaced in place)
    Upsert {
        /// Owning service prefix
        prefix: String,
        /// The published instance
        instance: ServiceInstance,
    },
    /// Instance withdrawn
    Remove {
        /// Owning service prefix
        prefix: String,
        /// URL of the withdrawn instance
        url: String,
    },
}

/// Registry of all watched services
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl ServiceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its name
    pub fn register(&self, service: Arc<Service>) {
        self.services
            .write()
            .insert(service.name().to_string(), service);
    }

    /// Look up a service by its exact prefix
    #[must_use]
    pub fn get(&self, prefix: &str) -> Option<Arc<Service>> {
        self.services.read().get(prefix).cloned()
    }

    /// Resolve the service for a proxied path and select one instance,
    /// all under the read lock so a request sees either the pre- or
    /// post-state of a watcher batch, never a partial one.
    ///
    /// The first registered prefix that appears as a substring of the path
    /// wins. Prefixes are expected to be mutually disjoint; the gateway
    /// does not enforce this. Returns `None` when no prefix matches; the
    /// inner `Option` is `None` when the matched service has no instances.
    #[must_use]
    pub fn select_for(&self, path: &str) -> Option<(String, Option<ServiceInstance>)> {
        let services = self.services.read();
        let (_, service) = services
            .iter()
            .find(|(prefix, _)| path.contains(prefix.as_str()))?;
        Some((service.name().to_string(), service.select()))
    }

    /// Apply one watcher event batch atomically with respect to readers
    pub fn apply(&self, events: &[RegistryEvent]) {
        let services = self.services.write();
        for event in events {
            match event {
                RegistryEvent::Upsert { prefix, instance } => {
                    if let Some(service) = services.get(prefix) {
                        debug!(service = %prefix, url = %instance.url, weight = instance.weight, "instance upserted");
                        service.upsert_instance(instance.clone());
                    }
                }
                RegistryEvent::Remove { prefix, url } => {
                    if let Some(service) = services.get(prefix) {
                        debug!(service = %prefix, url = %url, "instance removed");
                        service.remove_instance(url);
                    }
                }
            }
        }
    }

    /// Names of all registered services
    #[must_use]
    pub fn prefixes(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }
}
