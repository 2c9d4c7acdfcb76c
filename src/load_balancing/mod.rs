//! # Load Balancing Module
//!
//! Six interchangeable selection strategies behind one `LoadBalancer` trait,
//! plus the factory that caches one balancer per (strategy, service) key.
//!
//! Health awareness is lazy: every strategy re-filters its input down to
//! `is_available()` instances on each call and reads health straight off the
//! instance's shared status cell. There is no active health-check loop here.

pub mod consistent_hash;
pub mod factory;
pub mod least_connections;
pub mod strategies;
pub mod weighted;

use async_trait::async_trait;
use std::collections::HashSet;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{LoadBalanceStrategy, RequestContext, ServiceInstance};

pub use consistent_hash::ConsistentHashBalancer;
pub use factory::LoadBalancerFactory;
pub use least_connections::LeastConnectionsBalancer;
pub use strategies::{IpHashBalancer, RandomBalancer, RoundRobinBalancer};
pub use weighted::WeightedRoundRobinBalancer;

/// Core trait implemented by every load balancing strategy.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Select one available instance from the pool.
    ///
    /// The input may contain unavailable instances; filtering them out is the
    /// strategy's responsibility. Fails with `NoInstances` when the input is
    /// empty and `NoHealthyInstances` when the filtered set is empty.
    async fn select(
        &self,
        ctx: &RequestContext,
        instances: &[ServiceInstance],
    ) -> GatewayResult<ServiceInstance>;

    /// Which strategy this balancer implements.
    fn strategy(&self) -> LoadBalanceStrategy;

    /// Evict per-instance bookkeeping for instances no longer in `live_ids`.
    ///
    /// Stateless strategies no-op this call.
    fn cleanup_stale_state(&self, _live_ids: &HashSet<String>) {}

    /// Release a connection slot taken by a prior selection.
    ///
    /// Only meaningful for least-connections; omission leaks counter state
    /// there, which self-heals only when the instance disappears.
    fn release_connection(&self, _instance_id: &str) {}
}

/// Filter the input pool down to instances that may receive traffic, failing
/// with the error the caller must see for each empty case.
pub(crate) fn available_instances(
    instances: &[ServiceInstance],
) -> GatewayResult<Vec<&ServiceInstance>> {
    if instances.is_empty() {
        return Err(GatewayError::NoInstances);
    }
    let available: Vec<&ServiceInstance> =
        instances.iter().filter(|i| i.is_available()).collect();
    if available.is_empty() {
        return Err(GatewayError::NoHealthyInstances);
    }
    Ok(available)
}
