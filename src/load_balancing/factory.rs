//! Load balancer factory.
//!
//! Caches exactly one balancer per (strategy, tenant, group, service) key so
//! per-service state (smooth-wrr accumulators, connection counters, hash
//! rings) is isolated between services and reused across requests. Entries
//! live until explicitly removed; `remove_all_load_balancers` must run when a
//! service is deleted or abandoned balancer state accumulates without bound.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::core::types::{LoadBalanceStrategy, ServiceKey};
use crate::load_balancing::{
    ConsistentHashBalancer, IpHashBalancer, LeastConnectionsBalancer, LoadBalancer,
    RandomBalancer, RoundRobinBalancer, WeightedRoundRobinBalancer,
};

type BalancerCacheKey = (LoadBalanceStrategy, ServiceKey);

pub struct LoadBalancerFactory {
    // Read-mostly: lookups vastly outnumber creations.
    balancers: RwLock<HashMap<BalancerCacheKey, Arc<dyn LoadBalancer>>>,
}

impl LoadBalancerFactory {
    pub fn new() -> Self {
        Self {
            balancers: RwLock::new(HashMap::new()),
        }
    }

    /// Balancer for one (strategy, service) pair, created lazily.
    ///
    /// Read-then-write double check: the common path takes only the read
    /// lock, and a racing creator's instance wins over ours.
    pub fn get_load_balancer(
        &self,
        strategy: LoadBalanceStrategy,
        key: &ServiceKey,
    ) -> Arc<dyn LoadBalancer> {
        let cache_key = (strategy, key.clone());
        {
            let balancers = self.balancers.read();
            if let Some(balancer) = balancers.get(&cache_key) {
                return Arc::clone(balancer);
            }
        }

        let mut balancers = self.balancers.write();
        if let Some(balancer) = balancers.get(&cache_key) {
            return Arc::clone(balancer);
        }
        let balancer = Self::build(strategy);
        balancers.insert(cache_key, Arc::clone(&balancer));
        debug!(strategy = %strategy, service = %key, "created load balancer");
        balancer
    }

    fn build(strategy: LoadBalanceStrategy) -> Arc<dyn LoadBalancer> {
        match strategy {
            LoadBalanceStrategy::Random => Arc::new(RandomBalancer::new()),
            LoadBalanceStrategy::RoundRobin => Arc::new(RoundRobinBalancer::new()),
            LoadBalanceStrategy::WeightedRoundRobin => {
                Arc::new(WeightedRoundRobinBalancer::new())
            }
            LoadBalanceStrategy::LeastConnections => Arc::new(LeastConnectionsBalancer::new()),
            LoadBalanceStrategy::IpHash => Arc::new(IpHashBalancer::new()),
            LoadBalanceStrategy::ConsistentHash => Arc::new(ConsistentHashBalancer::new(None)),
        }
    }

    /// Drop one strategy's state for a service.
    pub fn remove_load_balancer(&self, strategy: LoadBalanceStrategy, key: &ServiceKey) {
        let removed = self
            .balancers
            .write()
            .remove(&(strategy, key.clone()))
            .is_some();
        if removed {
            debug!(strategy = %strategy, service = %key, "removed load balancer");
        }
    }

    /// Drop every strategy's state for a service; invoked on service deletion.
    pub fn remove_all_load_balancers(&self, key: &ServiceKey) {
        let mut balancers = self.balancers.write();
        for strategy in LoadBalanceStrategy::ALL {
            balancers.remove(&(strategy, key.clone()));
        }
        debug!(service = %key, "removed all load balancers for service");
    }

    /// Drop everything; used by `RegistryCache::clear`.
    pub fn clear(&self) {
        self.balancers.write().clear();
    }

    /// Number of cached balancer instances (diagnostics).
    pub fn len(&self) -> usize {
        self.balancers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.balancers.read().is_empty()
    }
}

impl Default for LoadBalancerFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_returns_identical_instance() {
        let factory = LoadBalancerFactory::new();
        let key = ServiceKey::new("t1", "g1", "users");

        let first = factory.get_load_balancer(LoadBalanceStrategy::RoundRobin, &key);
        let second = factory.get_load_balancer(LoadBalanceStrategy::RoundRobin, &key);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_state_isolated_per_service_and_strategy() {
        let factory = LoadBalancerFactory::new();
        let users = ServiceKey::new("t1", "g1", "users");
        let orders = ServiceKey::new("t1", "g1", "orders");

        let a = factory.get_load_balancer(LoadBalanceStrategy::RoundRobin, &users);
        let b = factory.get_load_balancer(LoadBalanceStrategy::RoundRobin, &orders);
        let c = factory.get_load_balancer(LoadBalanceStrategy::Random, &users);
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(factory.len(), 3);
    }

    #[test]
    fn test_remove_all_drops_every_strategy() {
        let factory = LoadBalancerFactory::new();
        let key = ServiceKey::new("t1", "g1", "users");

        for strategy in LoadBalanceStrategy::ALL {
            factory.get_load_balancer(strategy, &key);
        }
        assert_eq!(factory.len(), 6);

        factory.remove_all_load_balancers(&key);
        assert!(factory.is_empty());
    }

    #[test]
    fn test_removed_key_gets_fresh_instance() {
        let factory = LoadBalancerFactory::new();
        let key = ServiceKey::new("t1", "g1", "users");

        let first = factory.get_load_balancer(LoadBalanceStrategy::LeastConnections, &key);
        factory.remove_load_balancer(LoadBalanceStrategy::LeastConnections, &key);
        let second = factory.get_load_balancer(LoadBalanceStrategy::LeastConnections, &key);
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
