//! Smooth weighted round-robin (the Nginx algorithm).
//!
//! Every selection adds each instance's effective weight to its current
//! weight, picks the maximum, then subtracts the total effective weight from
//! the winner. This interleaves heavier instances through the sequence
//! instead of bursting them, and over one full cycle the selection counts
//! match the configured weights exactly.

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{LoadBalanceStrategy, RequestContext, ServiceInstance};
use crate::load_balancing::{available_instances, LoadBalancer};

#[derive(Default)]
struct WrrState {
    /// Accumulators; one entry per instance currently in the member set.
    current: HashMap<String, i64>,
    /// Configured weight with a floor of 1.
    effective: HashMap<String, i64>,
    total: i64,
    /// Instance ids the state was built for; a diff triggers a rebuild.
    members: BTreeSet<String>,
}

impl WrrState {
    /// Rebuild accumulators for a new member set. Vanished instances are
    /// dropped wholesale here, so no tombstones accumulate.
    fn rebuild(&mut self, instances: &[&ServiceInstance]) {
        self.current.clear();
        self.effective.clear();
        self.total = 0;
        self.members = instances.iter().map(|i| i.instance_id.clone()).collect();
        for instance in instances {
            let effective = i64::from(instance.weight.max(1));
            self.current.insert(instance.instance_id.clone(), 0);
            self.effective
                .insert(instance.instance_id.clone(), effective);
            self.total += effective;
        }
    }

    fn membership_changed(&self, instances: &[&ServiceInstance]) -> bool {
        if self.members.len() != instances.len() {
            return true;
        }
        instances
            .iter()
            .any(|i| !self.members.contains(&i.instance_id))
    }
}

/// Smooth weighted round-robin balancer; per-service state behind one mutex.
pub struct WeightedRoundRobinBalancer {
    state: Mutex<WrrState>,
}

impl WeightedRoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WrrState::default()),
        }
    }
}

impl Default for WeightedRoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for WeightedRoundRobinBalancer {
    async fn select(
        &self,
        _ctx: &RequestContext,
        instances: &[ServiceInstance],
    ) -> GatewayResult<ServiceInstance> {
        let available = available_instances(instances)?;

        let mut state = self.state.lock();
        if state.membership_changed(&available) {
            state.rebuild(&available);
            debug!(
                members = available.len(),
                strategy = "weighted-round-robin",
                "rebuilt smooth wrr state"
            );
        }

        let mut winner: Option<&ServiceInstance> = None;
        let mut best = i64::MIN;
        for instance in &available {
            let effective = state
                .effective
                .get(&instance.instance_id)
                .copied()
                .unwrap_or(1);
            let current = state
                .current
                .get_mut(&instance.instance_id)
                .ok_or_else(|| GatewayError::internal("wrr accumulator missing"))?;
            *current += effective;
            // Strict comparison keeps ties on slice order, making the
            // selection sequence deterministic.
            if *current > best {
                best = *current;
                winner = Some(instance);
            }
        }

        let winner = winner.ok_or(GatewayError::NoHealthyInstances)?;
        let total = state.total;
        if let Some(current) = state.current.get_mut(&winner.instance_id) {
            *current -= total;
        }

        counter!("load_balancer_selections", "strategy" => "weighted-round-robin").increment(1);
        debug!(
            instance_id = %winner.instance_id,
            weight = winner.weight,
            strategy = "weighted-round-robin",
            "selected instance"
        );
        Ok((*winner).clone())
    }

    fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::WeightedRoundRobin
    }

    fn cleanup_stale_state(&self, live_ids: &HashSet<String>) {
        let mut state = self.state.lock();
        state.current.retain(|id, _| live_ids.contains(id));
        state.effective.retain(|id, _| live_ids.contains(id));
        state.members.retain(|id| live_ids.contains(id));
        state.total = state.effective.values().sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    fn weighted_pool() -> Vec<ServiceInstance> {
        vec![
            ServiceInstance::new("t1", "a", "10.0.0.1", 8080).with_weight(5),
            ServiceInstance::new("t1", "b", "10.0.0.2", 8080).with_weight(1),
            ServiceInstance::new("t1", "c", "10.0.0.3", 8080).with_weight(1),
        ]
    }

    #[tokio::test]
    async fn test_smooth_sequence_for_5_1_1() {
        let balancer = WeightedRoundRobinBalancer::new();
        let instances = weighted_pool();
        let ctx = RequestContext::new(Method::GET, "/");

        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(balancer.select(&ctx, &instances).await.unwrap().instance_id);
        }
        // The classic smooth wrr cycle for weights {5,1,1}.
        assert_eq!(seen, vec!["a", "a", "b", "a", "c", "a", "a"]);
    }

    #[tokio::test]
    async fn test_ratio_is_exact_over_many_cycles() {
        let balancer = WeightedRoundRobinBalancer::new();
        let instances = weighted_pool();
        let ctx = RequestContext::new(Method::GET, "/");

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..700 {
            let id = balancer.select(&ctx, &instances).await.unwrap().instance_id;
            *counts.entry(id).or_default() += 1;
        }
        // 700 selections are exactly 100 full cycles of total weight 7.
        assert_eq!(counts["a"], 500);
        assert_eq!(counts["b"], 100);
        assert_eq!(counts["c"], 100);
    }

    #[tokio::test]
    async fn test_membership_change_rebuilds_state() {
        let balancer = WeightedRoundRobinBalancer::new();
        let mut instances = weighted_pool();
        let ctx = RequestContext::new(Method::GET, "/");

        for _ in 0..3 {
            balancer.select(&ctx, &instances).await.unwrap();
        }

        // Remove the heavy instance; selection must immediately be confined
        // to the survivors with fresh accumulators.
        instances.remove(0);
        for _ in 0..4 {
            let id = balancer.select(&ctx, &instances).await.unwrap().instance_id;
            assert!(id == "b" || id == "c");
        }
    }
}
