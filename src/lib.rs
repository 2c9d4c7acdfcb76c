//! # Gateway Core
//!
//! The service-registry and traffic-shaping core of an API gateway: a
//! concurrency-safe in-memory registry of tenants, groups, services, and
//! instances; pluggable load-balancing strategies; external registry
//! integration (Consul); and a configurable request/response filter chain.
//!
//! The crate is transport-agnostic: it operates on a `RequestContext`
//! extracted from the HTTP layer rather than on raw connections, so the same
//! engine serves an axum front end or an embedding test harness unchanged.

/// Error types and the shared data model: services, instances, keys, the
/// request context threaded through filters and balancers.
pub mod core;

/// External registry backends (Consul) and their per-service client
/// lifecycle management.
pub mod external;

/// Request/response filter chain: declarative configuration, factory, and
/// the concrete filter implementations.
pub mod filters;

/// Load-balancing strategies and the per-service balancer factory.
pub mod load_balancing;

/// The tenant → group → service → instance registry cache and its discovery
/// entry points.
pub mod registry;

pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::core::types::{
    LoadBalanceStrategy, RegistryType, RequestContext, Service, ServiceGroup, ServiceInstance,
    ServiceKey,
};
pub use crate::external::{ExternalRegistryConfig, ExternalRegistryManager};
pub use crate::filters::{Filter, FilterAction, FilterChain, FilterConfig, FilterFactory};
pub use crate::load_balancing::{LoadBalancer, LoadBalancerFactory};
pub use crate::registry::RegistryCache;
