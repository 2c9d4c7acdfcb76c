//! # Load Balancing Integration Tests
//!
//! Strategy behavior exercised through the factory, the way the registry
//! uses it: shared balancer state per (strategy, service) pair, health-aware
//! candidate filtering, and the stickiness properties of the hashing
//! strategies.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::http::Method;
use gateway_core::core::types::{HealthStatus, LoadBalanceStrategy, CTX_ROUTING_KEY};
use gateway_core::{LoadBalancer, LoadBalancerFactory, RequestContext, ServiceInstance, ServiceKey};
use serde_json::Value;

fn instances(specs: &[(&str, u32)]) -> Vec<ServiceInstance> {
    specs
        .iter()
        .enumerate()
        .map(|(i, (id, weight))| {
            ServiceInstance::new("t1", *id, format!("10.0.0.{}", i + 1), 8080).with_weight(*weight)
        })
        .collect()
}

fn ctx_from_ip(ip: &str) -> RequestContext {
    let addr: SocketAddr = format!("{ip}:50000").parse().unwrap();
    RequestContext::new(Method::GET, "/users").with_remote_addr(addr)
}

#[tokio::test]
async fn test_factory_shares_state_across_lookups() {
    let factory = LoadBalancerFactory::new();
    let key = ServiceKey::new("t1", "g1", "users");
    let pool = instances(&[("a", 1), ("b", 1)]);
    let ctx = RequestContext::new(Method::GET, "/users");

    // Two lookups, one counter: round robin must not restart.
    let first = factory
        .get_load_balancer(LoadBalanceStrategy::RoundRobin, &key)
        .select(&ctx, &pool)
        .await
        .unwrap();
    let second = factory
        .get_load_balancer(LoadBalanceStrategy::RoundRobin, &key)
        .select(&ctx, &pool)
        .await
        .unwrap();
    assert_ne!(first.instance_id, second.instance_id);
}

#[tokio::test]
async fn test_weighted_round_robin_respects_weights_across_a_cycle() {
    let factory = LoadBalancerFactory::new();
    let key = ServiceKey::new("t1", "g1", "users");
    let balancer = factory.get_load_balancer(LoadBalanceStrategy::WeightedRoundRobin, &key);
    let pool = instances(&[("a", 5), ("b", 1), ("c", 1)]);
    let ctx = RequestContext::new(Method::GET, "/users");

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..700 {
        let picked = balancer.select(&ctx, &pool).await.unwrap();
        *counts.entry(picked.instance_id).or_default() += 1;
    }
    assert_eq!(counts["a"], 500);
    assert_eq!(counts["b"], 100);
    assert_eq!(counts["c"], 100);
}

#[tokio::test]
async fn test_ip_hash_is_sticky_per_client() {
    let factory = LoadBalancerFactory::new();
    let key = ServiceKey::new("t1", "g1", "users");
    let balancer = factory.get_load_balancer(LoadBalanceStrategy::IpHash, &key);
    let pool = instances(&[("a", 1), ("b", 1), ("c", 1)]);

    for ip in ["10.9.0.1", "10.9.0.2", "192.168.1.77"] {
        let first = balancer.select(&ctx_from_ip(ip), &pool).await.unwrap();
        for _ in 0..5 {
            let again = balancer.select(&ctx_from_ip(ip), &pool).await.unwrap();
            assert_eq!(first.instance_id, again.instance_id);
        }
    }
}

#[tokio::test]
async fn test_consistent_hash_follows_the_routing_key() {
    let factory = LoadBalancerFactory::new();
    let key = ServiceKey::new("t1", "g1", "users");
    let balancer = factory.get_load_balancer(LoadBalanceStrategy::ConsistentHash, &key);
    let pool = instances(&[("a", 1), ("b", 1), ("c", 1)]);

    let mut ctx = RequestContext::new(Method::GET, "/users");
    ctx.set_value(CTX_ROUTING_KEY, Value::String("session-42".to_string()));

    let first = balancer.select(&ctx, &pool).await.unwrap();
    for _ in 0..10 {
        let again = balancer.select(&ctx, &pool).await.unwrap();
        assert_eq!(first.instance_id, again.instance_id);
    }

    // A different key is free to land elsewhere, and stays put once it does.
    let mut other = RequestContext::new(Method::GET, "/users");
    other.set_value(CTX_ROUTING_KEY, Value::String("session-43".to_string()));
    let target = balancer.select(&other, &pool).await.unwrap();
    let again = balancer.select(&other, &pool).await.unwrap();
    assert_eq!(target.instance_id, again.instance_id);
}

#[tokio::test]
async fn test_least_connections_prefers_the_idle_instance() {
    let factory = LoadBalancerFactory::new();
    let key = ServiceKey::new("t1", "g1", "users");
    let balancer = factory.get_load_balancer(LoadBalanceStrategy::LeastConnections, &key);
    let pool = instances(&[("a", 1), ("b", 1)]);
    let ctx = RequestContext::new(Method::GET, "/users");

    // Load one instance up without releasing.
    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(balancer.select(&ctx, &pool).await.unwrap().instance_id);
    }
    let counts = held.iter().fold(HashMap::<&String, usize>::new(), |mut m, id| {
        *m.entry(id).or_default() += 1;
        m
    });
    // Connections alternate: neither instance runs away with the pool.
    assert_eq!(counts.len(), 2);

    // Release everything from "a"; it becomes the preferred target.
    for id in &held {
        balancer.release_connection(id);
    }
    held.clear();
    for _ in 0..3 {
        let picked = balancer.select(&ctx, &pool).await.unwrap();
        held.push(picked.instance_id.clone());
    }
    assert!(held.contains(&"a".to_string()) && held.contains(&"b".to_string()));
}

#[tokio::test]
async fn test_unhealthy_instances_are_invisible_to_every_strategy() {
    let factory = LoadBalancerFactory::new();
    let pool = instances(&[("a", 5), ("b", 1)]);
    pool[0].record_health(HealthStatus::Unhealthy);
    let ctx = ctx_from_ip("10.9.0.1");

    for strategy in LoadBalanceStrategy::ALL {
        let key = ServiceKey::new("t1", "g1", "users");
        let balancer = factory.get_load_balancer(strategy, &key);
        for _ in 0..5 {
            let picked = balancer.select(&ctx, &pool).await.unwrap();
            assert_eq!(picked.instance_id, "b", "strategy {strategy:?} picked an unhealthy instance");
        }
    }
}

#[tokio::test]
async fn test_factory_keys_by_strategy_and_service() {
    let factory = LoadBalancerFactory::new();
    let users = ServiceKey::new("t1", "g1", "users");
    let orders = ServiceKey::new("t1", "g1", "orders");

    let a = factory.get_load_balancer(LoadBalanceStrategy::RoundRobin, &users);
    let b = factory.get_load_balancer(LoadBalanceStrategy::RoundRobin, &users);
    let c = factory.get_load_balancer(LoadBalanceStrategy::RoundRobin, &orders);
    let d = factory.get_load_balancer(LoadBalanceStrategy::Random, &users);
    assert!(std::sync::Arc::ptr_eq(&a, &b));
    assert!(!std::sync::Arc::ptr_eq(&a, &c));
    assert!(!std::sync::Arc::ptr_eq(&a, &d));
    assert_eq!(factory.len(), 3);

    factory.remove_all_load_balancers(&users);
    assert_eq!(factory.len(), 1);
}
