//! Least-connections balancer.
//!
//! Tracks an open-connection counter per instance: incremented on selection,
//! decremented by an explicit `release_connection` call. Forgetting to
//! release leaks counter state, which self-heals only when the instance
//! disappears and `cleanup_stale_state` runs.

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::{counter, gauge};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{LoadBalanceStrategy, RequestContext, ServiceInstance};
use crate::load_balancing::{available_instances, LoadBalancer};

pub struct LeastConnectionsBalancer {
    connections: DashMap<String, AtomicUsize>,
}

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Current open-connection count for an instance.
    pub fn connection_count(&self, instance_id: &str) -> usize {
        self.connections
            .get(instance_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn increment(&self, instance_id: &str) -> usize {
        let entry = self
            .connections
            .entry(instance_id.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        let count = entry.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("load_balancer_active_connections", "instance" => instance_id.to_string())
            .set(count as f64);
        count
    }
}

impl Default for LeastConnectionsBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for LeastConnectionsBalancer {
    async fn select(
        &self,
        _ctx: &RequestContext,
        instances: &[ServiceInstance],
    ) -> GatewayResult<ServiceInstance> {
        let available = available_instances(instances)?;

        // Compare connections-per-weight ratios so heavier instances absorb
        // proportionally more open connections.
        let mut best_ratio = f64::INFINITY;
        let mut candidates: Vec<&ServiceInstance> = Vec::new();
        for instance in &available {
            let connections = self.connection_count(&instance.instance_id) as f64;
            let ratio = connections / f64::from(instance.weight.max(1));
            if ratio < best_ratio {
                best_ratio = ratio;
                candidates.clear();
                candidates.push(instance);
            } else if ratio == best_ratio {
                candidates.push(instance);
            }
        }

        // Ties break by coin flip, so selection is not deterministic here.
        let selected = if candidates.len() == 1 {
            candidates[0]
        } else if candidates.is_empty() {
            return Err(GatewayError::NoHealthyInstances);
        } else {
            candidates[rand::thread_rng().gen_range(0..candidates.len())]
        };

        let count = self.increment(&selected.instance_id);
        counter!("load_balancer_selections", "strategy" => "least-connections").increment(1);
        debug!(
            instance_id = %selected.instance_id,
            connections = count,
            strategy = "least-connections",
            "selected instance"
        );
        Ok(selected.clone())
    }

    fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::LeastConnections
    }

    fn cleanup_stale_state(&self, live_ids: &HashSet<String>) {
        self.connections.retain(|id, _| live_ids.contains(id));
    }

    fn release_connection(&self, instance_id: &str) {
        if let Some(entry) = self.connections.get(instance_id) {
            // Saturating decrement; a double release must not underflow.
            let mut current = entry.load(Ordering::Relaxed);
            while current > 0 {
                match entry.compare_exchange_weak(
                    current,
                    current - 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
            gauge!("load_balancer_active_connections", "instance" => instance_id.to_string())
                .set(entry.load(Ordering::Relaxed) as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    fn pool() -> Vec<ServiceInstance> {
        vec![
            ServiceInstance::new("t1", "i0", "10.0.0.1", 8080),
            ServiceInstance::new("t1", "i1", "10.0.0.2", 8080),
        ]
    }

    #[tokio::test]
    async fn test_prefers_fewer_connections() {
        let balancer = LeastConnectionsBalancer::new();
        let instances = pool();
        let ctx = RequestContext::new(Method::GET, "/");

        // Load i0 with three open connections.
        for _ in 0..3 {
            balancer.increment("i0");
        }

        let selected = balancer.select(&ctx, &instances).await.unwrap();
        assert_eq!(selected.instance_id, "i1");
    }

    #[tokio::test]
    async fn test_release_rebalances() {
        let balancer = LeastConnectionsBalancer::new();
        let instances = pool();
        let ctx = RequestContext::new(Method::GET, "/");

        let first = balancer.select(&ctx, &instances).await.unwrap();
        // The other instance now has fewer connections.
        let second = balancer.select(&ctx, &instances).await.unwrap();
        assert_ne!(first.instance_id, second.instance_id);

        balancer.release_connection(&first.instance_id);
        assert_eq!(balancer.connection_count(&first.instance_id), 0);
        // Double release stays at zero.
        balancer.release_connection(&first.instance_id);
        assert_eq!(balancer.connection_count(&first.instance_id), 0);
    }

    #[tokio::test]
    async fn test_cleanup_drops_vanished_instances() {
        let balancer = LeastConnectionsBalancer::new();
        balancer.increment("gone");
        balancer.increment("kept");

        let live: HashSet<String> = ["kept".to_string()].into_iter().collect();
        balancer.cleanup_stale_state(&live);

        assert_eq!(balancer.connection_count("gone"), 0);
        assert_eq!(balancer.connection_count("kept"), 1);
    }

    #[tokio::test]
    async fn test_weight_scales_capacity() {
        let balancer = LeastConnectionsBalancer::new();
        let instances = vec![
            ServiceInstance::new("t1", "heavy", "10.0.0.1", 8080).with_weight(4),
            ServiceInstance::new("t1", "light", "10.0.0.2", 8080).with_weight(1),
        ];
        let ctx = RequestContext::new(Method::GET, "/");

        // heavy at 2 connections (ratio 0.5) still beats light at 1 (ratio 1.0).
        balancer.increment("heavy");
        balancer.increment("heavy");
        balancer.increment("light");

        let selected = balancer.select(&ctx, &instances).await.unwrap();
        assert_eq!(selected.instance_id, "heavy");
    }
}
