//! # Core Types Module
//!
//! Foundational data structures for the registry cache, load balancing engine,
//! and filter pipeline: the tenant → service group → service → instance model,
//! the strategy and registry-type enumerations, and the mutable request context
//! that flows through filters and into the balancers.
//!
//! ## Ownership notes
//!
//! - `ServiceInstance` health lives in an `Arc`-shared cell of atomics. Cloning
//!   an instance (as every copy-on-write snapshot does) shares the cell, so a
//!   health update is visible through all snapshots without re-cloning the tree.
//! - `RequestContext` is owned by the request task and mutated in place by the
//!   filter chain; it is never shared across threads mid-flight.

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::error::GatewayError;

/// Context key for the client IP consumed by the IP-hash balancer.
pub const CTX_CLIENT_IP: &str = "client_ip";
/// Context key for the routing key consumed by the consistent-hash balancer.
pub const CTX_ROUTING_KEY: &str = "routing_key";
/// Flag set by the method filter when a request's method was rejected.
pub const CTX_METHOD_REJECTED: &str = "method_rejected";
/// Computed `Allow:` header value set alongside a method rejection.
pub const CTX_ALLOW_HEADER: &str = "allow_header";
/// Flag set by the method filter for `OPTIONS` requests that should be
/// short-circuited by the handler instead of being rejected.
pub const CTX_OPTIONS_SHORT_CIRCUIT: &str = "options_short_circuit";
/// Cookie operations deferred from the request phase to the response phase.
pub const CTX_RESPONSE_COOKIE_OPS: &str = "response_cookie_ops";

/// Where a service's instances are tracked.
///
/// `Internal` instances are memory-resident in this process; every other kind
/// is owned by a third-party registry and proxied through an
/// `ExternalRegistryClient`. The two paths are never mixed for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryType {
    Internal,
    Consul,
    Kubernetes,
    Nats,
    Etcd,
}

impl RegistryType {
    /// Whether instances of this type are proxied through an external client.
    pub fn is_external(&self) -> bool {
        !matches!(self, RegistryType::Internal)
    }
}

impl fmt::Display for RegistryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryType::Internal => write!(f, "internal"),
            RegistryType::Consul => write!(f, "consul"),
            RegistryType::Kubernetes => write!(f, "kubernetes"),
            RegistryType::Nats => write!(f, "nats"),
            RegistryType::Etcd => write!(f, "etcd"),
        }
    }
}

/// Load balancing strategy selection.
///
/// All six strategies live in this single enumeration; the canonical string
/// form is kebab-case. `FromStr` additionally accepts the legacy
/// `CONSISTENT_HASH` spelling that older stored configurations carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalanceStrategy {
    Random,
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    IpHash,
    ConsistentHash,
}

impl LoadBalanceStrategy {
    /// All strategies, in canonical order.
    pub const ALL: [LoadBalanceStrategy; 6] = [
        LoadBalanceStrategy::Random,
        LoadBalanceStrategy::RoundRobin,
        LoadBalanceStrategy::WeightedRoundRobin,
        LoadBalanceStrategy::LeastConnections,
        LoadBalanceStrategy::IpHash,
        LoadBalanceStrategy::ConsistentHash,
    ];

    /// Canonical strategy name used in configuration and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::Random => "random",
            LoadBalanceStrategy::RoundRobin => "round-robin",
            LoadBalanceStrategy::WeightedRoundRobin => "weighted-round-robin",
            LoadBalanceStrategy::LeastConnections => "least-connections",
            LoadBalanceStrategy::IpHash => "ip-hash",
            LoadBalanceStrategy::ConsistentHash => "consistent-hash",
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(LoadBalanceStrategy::Random),
            "round-robin" => Ok(LoadBalanceStrategy::RoundRobin),
            "weighted-round-robin" => Ok(LoadBalanceStrategy::WeightedRoundRobin),
            "least-connections" => Ok(LoadBalanceStrategy::LeastConnections),
            "ip-hash" => Ok(LoadBalanceStrategy::IpHash),
            // Legacy spelling kept for stored configurations.
            "consistent-hash" | "CONSISTENT_HASH" => Ok(LoadBalanceStrategy::ConsistentHash),
            other => Err(GatewayError::validation(format!(
                "unknown load balance strategy: {other}"
            ))),
        }
    }
}

/// Health of a service instance as reported by health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Operational status of a service instance (administrative up/down).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Up,
    Down,
}

/// Shared mutable health state of one instance.
///
/// Kept behind an `Arc` so every clone of a `ServiceInstance` (including the
/// shallow copies inside copy-on-write snapshots) observes the same health
/// flips. Millisecond timestamp of 0 means "never checked".
#[derive(Debug)]
struct HealthCell {
    healthy: AtomicBool,
    up: AtomicBool,
    active: AtomicBool,
    last_check_ms: AtomicI64,
}

impl HealthCell {
    fn new(healthy: bool, up: bool, active: bool, last_check_ms: i64) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            up: AtomicBool::new(up),
            active: AtomicBool::new(active),
            last_check_ms: AtomicI64::new(last_check_ms),
        }
    }
}

/// One concrete network endpoint backing a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "InstanceRecord", into = "InstanceRecord")]
pub struct ServiceInstance {
    pub tenant_id: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    health: Arc<HealthCell>,
}

impl ServiceInstance {
    /// Create an instance that starts healthy, up, and active.
    pub fn new(
        tenant_id: impl Into<String>,
        instance_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            instance_id: instance_id.into(),
            host: host.into(),
            port,
            weight: 1,
            health: Arc::new(HealthCell::new(true, true, true, 0)),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// An instance receives traffic only when it is healthy, up, and active.
    pub fn is_available(&self) -> bool {
        self.health.healthy.load(Ordering::Acquire)
            && self.health.up.load(Ordering::Acquire)
            && self.health.active.load(Ordering::Acquire)
    }

    pub fn health_status(&self) -> HealthStatus {
        if self.health.healthy.load(Ordering::Acquire) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Record a health-check result: status plus check timestamp, in place.
    ///
    /// Mutates the shared health cell, so every snapshot holding a clone of
    /// this instance observes the flip immediately.
    pub fn record_health(&self, status: HealthStatus) {
        self.health
            .healthy
            .store(status == HealthStatus::Healthy, Ordering::Release);
        self.health
            .last_check_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub fn instance_status(&self) -> InstanceStatus {
        if self.health.up.load(Ordering::Acquire) {
            InstanceStatus::Up
        } else {
            InstanceStatus::Down
        }
    }

    pub fn set_instance_status(&self, status: InstanceStatus) {
        self.health
            .up
            .store(status == InstanceStatus::Up, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.health.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.health.active.store(active, Ordering::Release);
    }

    /// Timestamp of the last recorded health check, if any.
    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        let ms = self.health.last_check_ms.load(Ordering::Acquire);
        if ms == 0 {
            None
        } else {
            Utc.timestamp_millis_opt(ms).single()
        }
    }

    /// `host:port` form used for upstream dialing and Consul registration.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Plain serde representation of a `ServiceInstance`.
///
/// The live type keeps its health behind atomics; this record is the wire and
/// storage form the admin surface exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub tenant_id: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_health")]
    pub health_status: HealthStatus,
    #[serde(default = "default_status")]
    pub instance_status: InstanceStatus,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
}

fn default_weight() -> u32 {
    1
}

fn default_health() -> HealthStatus {
    HealthStatus::Healthy
}

fn default_status() -> InstanceStatus {
    InstanceStatus::Up
}

fn default_true() -> bool {
    true
}

impl From<InstanceRecord> for ServiceInstance {
    fn from(rec: InstanceRecord) -> Self {
        let last_check_ms = rec
            .last_health_check
            .map(|t| t.timestamp_millis())
            .unwrap_or(0);
        Self {
            tenant_id: rec.tenant_id,
            instance_id: rec.instance_id,
            host: rec.host,
            port: rec.port,
            weight: rec.weight,
            health: Arc::new(HealthCell::new(
                rec.health_status == HealthStatus::Healthy,
                rec.instance_status == InstanceStatus::Up,
                rec.active,
                last_check_ms,
            )),
        }
    }
}

impl From<ServiceInstance> for InstanceRecord {
    fn from(inst: ServiceInstance) -> Self {
        Self {
            health_status: inst.health_status(),
            instance_status: inst.instance_status(),
            active: inst.is_active(),
            last_health_check: inst.last_health_check(),
            tenant_id: inst.tenant_id,
            instance_id: inst.instance_id,
            host: inst.host,
            port: inst.port,
            weight: inst.weight,
        }
    }
}

/// A named, load-balanced backend addressed by one or more instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub tenant_id: String,
    pub group_id: String,
    pub name: String,
    pub registry_type: RegistryType,
    #[serde(default = "default_strategy")]
    pub strategy: LoadBalanceStrategy,
    #[serde(default)]
    pub instances: Vec<ServiceInstance>,
}

fn default_strategy() -> LoadBalanceStrategy {
    LoadBalanceStrategy::RoundRobin
}

impl Service {
    pub fn new(
        tenant_id: impl Into<String>,
        group_id: impl Into<String>,
        name: impl Into<String>,
        registry_type: RegistryType,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            group_id: group_id.into(),
            name: name.into(),
            registry_type,
            strategy: default_strategy(),
            instances: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_instances(mut self, instances: Vec<ServiceInstance>) -> Self {
        self.instances = instances;
        self
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.tenant_id, &self.group_id, &self.name)
    }
}

/// A named collection of services within a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceGroup {
    pub tenant_id: String,
    pub group_id: String,
    #[serde(default)]
    pub services: HashMap<String, Service>,
}

impl ServiceGroup {
    pub fn new(tenant_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            group_id: group_id.into(),
            services: HashMap::new(),
        }
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.services.insert(service.name.clone(), service);
        self
    }
}

/// Composite key identifying one service within the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub tenant_id: String,
    pub group_id: String,
    pub service: String,
}

impl ServiceKey {
    pub fn new(
        tenant_id: impl Into<String>,
        group_id: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            group_id: group_id.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.group_id, self.service)
    }
}

/// Aggregate registry counters, computed by full traversal on demand.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub tenants: usize,
    pub groups: usize,
    pub services: usize,
    pub instances: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
}

/// Response parts accumulated while a request is in flight.
#[derive(Debug, Clone)]
pub struct ResponseParts {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Default for ResponseParts {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Mutable view of an in-flight request, threaded through the filter chain
/// and consulted by the load balancers.
///
/// Balancer inputs (`client_ip`, `routing_key`) are read out of the generic
/// `data` map rather than typed fields; absence degrades gracefully per
/// strategy, it never panics.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    /// Query parameters in original order; one entry per occurrence.
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
    pub response: Option<ResponseParts>,
    pub data: HashMap<String, Value>,
}

impl RequestContext {
    /// Build a context from a method and a path with optional `?query`.
    pub fn new(method: Method, path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), parse_query(q)),
            None => (path_and_query.to_string(), Vec::new()),
        };
        Self {
            request_id: Uuid::new_v4().to_string(),
            method,
            path,
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
            response: None,
            data: HashMap::new(),
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// First value of a query parameter, if present.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Re-serialize the query pairs into `k=v&k2=v2` form.
    pub fn query_string(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.query {
            serializer.append_pair(k, v);
        }
        serializer.finish()
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set_flag(&mut self, key: impl Into<String>) {
        self.data.insert(key.into(), Value::Bool(true));
    }

    pub fn flag(&self, key: &str) -> bool {
        self.data
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Client IP for hashing: the context value wins, falling back to the
    /// transport-level remote address.
    pub fn client_ip(&self) -> Option<String> {
        if let Some(ip) = self.get_str(CTX_CLIENT_IP) {
            return Some(ip.to_string());
        }
        self.remote_addr.map(|a| a.ip().to_string())
    }

    /// Routing key consumed by the consistent-hash balancer.
    pub fn routing_key(&self) -> Option<&str> {
        self.get_str(CTX_ROUTING_KEY)
    }

    /// Response parts, created lazily on first access.
    pub fn response_mut(&mut self) -> &mut ResponseParts {
        self.response.get_or_insert_with(ResponseParts::default)
    }
}

fn parse_query(raw: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "weighted-round-robin".parse::<LoadBalanceStrategy>().unwrap(),
            LoadBalanceStrategy::WeightedRoundRobin
        );
        // Legacy constant spelling still resolves.
        assert_eq!(
            "CONSISTENT_HASH".parse::<LoadBalanceStrategy>().unwrap(),
            LoadBalanceStrategy::ConsistentHash
        );
        assert!("fastest".parse::<LoadBalanceStrategy>().is_err());
    }

    #[test]
    fn test_instance_availability() {
        let instance = ServiceInstance::new("t1", "i1", "10.0.0.1", 8080);
        assert!(instance.is_available());

        instance.record_health(HealthStatus::Unhealthy);
        assert!(!instance.is_available());
        assert!(instance.last_health_check().is_some());

        instance.record_health(HealthStatus::Healthy);
        instance.set_instance_status(InstanceStatus::Down);
        assert!(!instance.is_available());

        instance.set_instance_status(InstanceStatus::Up);
        instance.set_active(false);
        assert!(!instance.is_available());
    }

    #[test]
    fn test_clones_share_health_cell() {
        let instance = ServiceInstance::new("t1", "i1", "10.0.0.1", 8080);
        let snapshot = instance.clone();

        instance.record_health(HealthStatus::Unhealthy);
        assert_eq!(snapshot.health_status(), HealthStatus::Unhealthy);
        assert!(!snapshot.is_available());
    }

    #[test]
    fn test_instance_serde_round_trip() {
        let instance = ServiceInstance::new("t1", "i1", "10.0.0.1", 8080).with_weight(5);
        instance.record_health(HealthStatus::Unhealthy);

        let json = serde_json::to_string(&instance).unwrap();
        assert!(json.contains("\"tenantId\":\"t1\""));

        let back: ServiceInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(back.weight, 5);
        assert_eq!(back.health_status(), HealthStatus::Unhealthy);
        assert!(back.last_health_check().is_some());
    }

    #[test]
    fn test_request_context_query() {
        let ctx = RequestContext::new(Method::GET, "/api/users?page=2&sort=name");
        assert_eq!(ctx.path, "/api/users");
        assert_eq!(ctx.query_param("page"), Some("2"));
        assert_eq!(ctx.query_param("sort"), Some("name"));
        assert_eq!(ctx.query_string(), "page=2&sort=name");
    }

    #[test]
    fn test_request_context_client_ip_fallback() {
        let mut ctx = RequestContext::new(Method::GET, "/")
            .with_remote_addr("192.168.1.9:4242".parse().unwrap());
        assert_eq!(ctx.client_ip().as_deref(), Some("192.168.1.9"));

        ctx.set_value(CTX_CLIENT_IP, Value::String("10.1.1.1".to_string()));
        assert_eq!(ctx.client_ip().as_deref(), Some("10.1.1.1"));
    }
}
