//! Instance selection policies
//!
//! Given a service's instance list and its selection cursor, picks one
//! backend instance. Round-robin variants advance the cursor; random
//! variants leave it untouched. Weight arithmetic walks the list in order,
//! subtracting each instance's weight from the draw until it lands.

use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::registry::ServiceInstance;

/// Selection policy for a service's instance list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    /// `instances[cursor mod N]`, then advance the cursor
    #[default]
    RoundRobin,
    /// Uniform over the list
    Random,
    /// Draw proportional to weight; all-zero weights fall back to the first
    WeightedRandom,
    /// Deterministic weighted rotation driven by the cursor
    WeightedRoundRobin,
}

/// Select one instance, or `None` when the list is empty.
///
/// `cursor` is only advanced by the round-robin policies.
pub fn select(
    policy: LoadBalancePolicy,
    instances: &[ServiceInstance],
    cursor: &mut u64,
) -> Option<ServiceInstance> {
    if instances.is_empty() {
        return None;
    }

    let picked = match policy {
        LoadBalancePolicy::RoundRobin => {
            let idx = (*cursor % instances.len() as u64) as usize;
            *cursor += 1;
            instances[idx].clone()
        }
        LoadBalancePolicy::Random => {
            let idx = rand::rng().random_range(0..instances.len());
            instances[idx].clone()
        }
        LoadBalancePolicy::WeightedRandom => {
            let total: u64 = instances.iter().map(|i| u64::from(i.weight)).sum();
            if total == 0 {
                instances[0].clone()
            } else {
                let r = rand::rng().random_range(0..total);
                pick_by_weight(instances, r)
            }
        }
        LoadBalancePolicy::WeightedRoundRobin => {
            let total: u64 = instances.iter().map(|i| u64::from(i.weight)).sum();
            if total == 0 {
                instances[0].clone()
            } else {
                let r = *cursor % total;
                *cursor += 1;
                pick_by_weight(instances, r)
            }
        }
    };

    Some(picked)
}

/// Walk the list in order, subtracting weights from `r` until it lands.
///
/// Precondition: `r < Σ weight`, so the walk always terminates inside the
/// list; the trailing fallback only guards arithmetic drift.
fn pick_by_weight(instances: &[ServiceInstance], mut r: u64) -> ServiceInstance {
    for instance in instances {
        let w = u64::from(instance.weight);
        if r < w {
            return instance.clone();
        }
        r -= w;
    }
    instances[instances.len() - 1].clone()
}
