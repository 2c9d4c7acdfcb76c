//! Stateless and near-stateless strategies: random, round-robin, and IP-hash.
//!
//! Round-robin keeps nothing but an atomic counter; random and IP-hash keep
//! no per-instance state at all, so `cleanup_stale_state` is a no-op for all
//! three.

use async_trait::async_trait;
use metrics::counter;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::core::error::GatewayResult;
use crate::core::types::{LoadBalanceStrategy, RequestContext, ServiceInstance};
use crate::load_balancing::{available_instances, LoadBalancer};

/// Uniform random pick from the available set.
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for RandomBalancer {
    async fn select(
        &self,
        _ctx: &RequestContext,
        instances: &[ServiceInstance],
    ) -> GatewayResult<ServiceInstance> {
        let available = available_instances(instances)?;
        let index = rand::thread_rng().gen_range(0..available.len());
        let selected = available[index];

        counter!("load_balancer_selections", "strategy" => "random").increment(1);
        debug!(
            instance_id = %selected.instance_id,
            strategy = "random",
            "selected instance"
        );
        Ok(selected.clone())
    }

    fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::Random
    }
}

/// Atomically incremented counter modulo the available-set size.
///
/// Fairness across calls is exact but unweighted; weights are ignored.
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for RoundRobinBalancer {
    async fn select(
        &self,
        _ctx: &RequestContext,
        instances: &[ServiceInstance],
    ) -> GatewayResult<ServiceInstance> {
        let available = available_instances(instances)?;
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % available.len();
        let selected = available[index];

        counter!("load_balancer_selections", "strategy" => "round-robin").increment(1);
        debug!(
            instance_id = %selected.instance_id,
            strategy = "round-robin",
            "selected instance"
        );
        Ok(selected.clone())
    }

    fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::RoundRobin
    }
}

/// CRC32 of the context `client_ip`, modulo the available-set size.
///
/// A missing client IP silently degrades to random selection; that fallback
/// is deliberate, not an error.
pub struct IpHashBalancer;

impl IpHashBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for IpHashBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for IpHashBalancer {
    async fn select(
        &self,
        ctx: &RequestContext,
        instances: &[ServiceInstance],
    ) -> GatewayResult<ServiceInstance> {
        let available = available_instances(instances)?;

        let index = match ctx.client_ip() {
            Some(ip) => crc32fast::hash(ip.as_bytes()) as usize % available.len(),
            None => {
                debug!(strategy = "ip-hash", "no client ip in context, degrading to random");
                rand::thread_rng().gen_range(0..available.len())
            }
        };
        let selected = available[index];

        counter!("load_balancer_selections", "strategy" => "ip-hash").increment(1);
        debug!(
            instance_id = %selected.instance_id,
            strategy = "ip-hash",
            "selected instance"
        );
        Ok(selected.clone())
    }

    fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::IpHash
    }
}
