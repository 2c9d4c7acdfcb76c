//! Consistent-hash balancer.
//!
//! Keys and instances map onto one hash ring; each instance contributes a
//! configurable number of virtual nodes so membership changes remap only a
//! small fraction of keys. The ring is rebuilt in full, but only when the
//! available membership actually changes.

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;
use uuid::Uuid;

use crate::core::error::GatewayResult;
use crate::core::types::{LoadBalanceStrategy, RequestContext, ServiceInstance};
use crate::load_balancing::{available_instances, LoadBalancer};

/// Virtual nodes per instance when none is configured.
pub const DEFAULT_REPLICAS: usize = 10;

#[derive(Default)]
struct RingState {
    /// Ring position → instance id.
    ring: BTreeMap<u64, String>,
    /// Instance ids the ring was built for.
    members: BTreeSet<String>,
}

pub struct ConsistentHashBalancer {
    state: Mutex<RingState>,
    replicas: usize,
}

impl ConsistentHashBalancer {
    pub fn new(replicas: Option<usize>) -> Self {
        Self {
            state: Mutex::new(RingState::default()),
            replicas: replicas.unwrap_or(DEFAULT_REPLICAS).max(1),
        }
    }

    /// Hash a string onto the ring's u64 key space.
    fn hash(value: &str) -> u64 {
        let digest = Sha256::digest(value.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[0..8]);
        u64::from_be_bytes(bytes)
    }

    /// Hash key for a request: routing key, else client IP, else a random
    /// nonce so keyless requests still spread across the ring.
    fn request_key(ctx: &RequestContext) -> String {
        if let Some(key) = ctx.routing_key() {
            return key.to_string();
        }
        if let Some(ip) = ctx.client_ip() {
            return ip;
        }
        Uuid::new_v4().to_string()
    }

    fn rebuild_ring(&self, state: &mut RingState, available: &[&ServiceInstance]) {
        state.ring.clear();
        state.members = available.iter().map(|i| i.instance_id.clone()).collect();
        for instance in available {
            for replica in 0..self.replicas {
                let position = Self::hash(&format!("{}:{replica}", instance.instance_id));
                state.ring.insert(position, instance.instance_id.clone());
            }
        }
    }

    /// First ring position >= the key's hash, wrapping to the start.
    fn lookup(state: &RingState, key_hash: u64) -> Option<String> {
        state
            .ring
            .range(key_hash..)
            .next()
            .or_else(|| state.ring.iter().next())
            .map(|(_, id)| id.clone())
    }
}

#[async_trait]
impl LoadBalancer for ConsistentHashBalancer {
    async fn select(
        &self,
        ctx: &RequestContext,
        instances: &[ServiceInstance],
    ) -> GatewayResult<ServiceInstance> {
        let available = available_instances(instances)?;

        let resolved = {
            let mut state = self.state.lock();
            let changed = state.members.len() != available.len()
                || available.iter().any(|i| !state.members.contains(&i.instance_id));
            if changed {
                self.rebuild_ring(&mut state, &available);
                debug!(
                    members = available.len(),
                    replicas = self.replicas,
                    strategy = "consistent-hash",
                    "rebuilt hash ring"
                );
            }
            let key = Self::request_key(ctx);
            Self::lookup(&state, Self::hash(&key))
        };

        // A stale ring entry that raced a membership change falls back to a
        // random available instance.
        let selected = resolved
            .and_then(|id| available.iter().find(|i| i.instance_id == id).copied())
            .unwrap_or_else(|| available[rand::thread_rng().gen_range(0..available.len())]);

        counter!("load_balancer_selections", "strategy" => "consistent-hash").increment(1);
        debug!(
            instance_id = %selected.instance_id,
            strategy = "consistent-hash",
            "selected instance"
        );
        Ok(selected.clone())
    }

    fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::ConsistentHash
    }

    fn cleanup_stale_state(&self, live_ids: &HashSet<String>) {
        let mut state = self.state.lock();
        state.ring.retain(|_, id| live_ids.contains(id));
        state.members.retain(|id| live_ids.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use serde_json::Value;
    use crate::core::types::CTX_ROUTING_KEY;

    fn pool(n: usize) -> Vec<ServiceInstance> {
        (0..n)
            .map(|i| ServiceInstance::new("t1", format!("i{i}"), format!("10.0.0.{i}"), 8080))
            .collect()
    }

    fn ctx_with_key(key: &str) -> RequestContext {
        let mut ctx = RequestContext::new(Method::GET, "/");
        ctx.set_value(CTX_ROUTING_KEY, Value::String(key.to_string()));
        ctx
    }

    #[tokio::test]
    async fn test_fixed_key_is_stable() {
        let balancer = ConsistentHashBalancer::new(None);
        let instances = pool(5);
        let ctx = ctx_with_key("user-42");

        let first = balancer.select(&ctx, &instances).await.unwrap().instance_id;
        for _ in 0..25 {
            let again = balancer.select(&ctx, &instances).await.unwrap().instance_id;
            assert_eq!(again, first);
        }
    }

    #[tokio::test]
    async fn test_adding_instance_remaps_bounded_fraction() {
        let balancer_before = ConsistentHashBalancer::new(Some(50));
        let balancer_after = ConsistentHashBalancer::new(Some(50));
        let before = pool(4);
        let mut after = pool(4);
        after.push(ServiceInstance::new("t1", "i4", "10.0.0.4", 8080));

        let mut moved = 0usize;
        let total = 200usize;
        for k in 0..total {
            let ctx = ctx_with_key(&format!("key-{k}"));
            let old = balancer_before.select(&ctx, &before).await.unwrap().instance_id;
            let new = balancer_after.select(&ctx, &after).await.unwrap().instance_id;
            if old != new {
                moved += 1;
            }
        }
        // Roughly 1/5 of keys should move to the new instance; anything under
        // half proves the mapping is consistent rather than rehashed wholesale.
        assert!(moved < total / 2, "too many keys remapped: {moved}/{total}");
    }

    #[tokio::test]
    async fn test_keyless_request_still_selects() {
        let balancer = ConsistentHashBalancer::new(None);
        let instances = pool(3);
        let ctx = RequestContext::new(Method::GET, "/");

        let selected = balancer.select(&ctx, &instances).await.unwrap();
        assert!(instances.iter().any(|i| i.instance_id == selected.instance_id));
    }

    #[tokio::test]
    async fn test_unavailable_target_falls_back() {
        let balancer = ConsistentHashBalancer::new(None);
        let instances = pool(3);
        let ctx = ctx_with_key("session-9");

        let pinned = balancer.select(&ctx, &instances).await.unwrap();
        pinned.record_health(crate::core::types::HealthStatus::Unhealthy);

        // The pinned instance left the available set; selection must land on
        // one of the survivors.
        let fallback = balancer.select(&ctx, &instances).await.unwrap();
        assert_ne!(fallback.instance_id, pinned.instance_id);
    }
}
