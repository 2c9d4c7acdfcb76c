//! # External Registry Integration
//!
//! Pluggable clients for services whose instances live in a third-party
//! registry rather than this process's memory. One backend (Consul) is
//! implemented; the remaining registry types fail with an explicit
//! not-implemented error instead of silently behaving as internal.

pub mod consul;
pub mod manager;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::core::error::GatewayResult;
use crate::core::types::{HealthStatus, Service, ServiceInstance, ServiceKey};

pub use consul::ConsulClient;
pub use manager::ExternalRegistryManager;

/// Connection settings for one external registry backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRegistryConfig {
    /// Base address of the registry, e.g. `http://127.0.0.1:8500`.
    pub address: String,
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Per-request timeout applied by the client.
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Serializes the timeout as a plain seconds count.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

impl ExternalRegistryConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            datacenter: None,
            token: None,
            timeout: default_timeout(),
        }
    }

    /// Content hash of the configuration. Clients compare this to decide
    /// whether their underlying connection must be rebuilt.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.address.as_bytes());
        hasher.update(self.datacenter.as_deref().unwrap_or("").as_bytes());
        hasher.update(self.token.as_deref().unwrap_or("").as_bytes());
        hasher.update(self.timeout.as_secs().to_be_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Client for one external service registry backend.
///
/// All calls perform network I/O; the client applies the configured request
/// timeout but callers remain responsible for their own deadlines.
#[async_trait]
pub trait ExternalRegistryClient: Send + Sync {
    /// Re-initialize the underlying connection if the configuration's content
    /// hash changed, releasing the old connection first. Safe to call often;
    /// a no-op when the hash is unchanged.
    async fn apply_config(&self, config: &ExternalRegistryConfig) -> GatewayResult<()>;

    /// Register a service and all of its instances.
    async fn register_service(&self, service: &Service) -> GatewayResult<()>;

    /// Deregister a service and all of its instances.
    async fn deregister_service(&self, key: &ServiceKey) -> GatewayResult<()>;

    async fn register_instance(
        &self,
        key: &ServiceKey,
        instance: &ServiceInstance,
    ) -> GatewayResult<()>;

    async fn deregister_instance(&self, key: &ServiceKey, instance_id: &str) -> GatewayResult<()>;

    /// Update a registered instance in place (upsert semantics).
    async fn update_instance(
        &self,
        key: &ServiceKey,
        instance: &ServiceInstance,
    ) -> GatewayResult<()>;

    /// Names of all services known to the registry.
    async fn discover_services(&self) -> GatewayResult<Vec<String>>;

    /// All instances of one service, with registry-reported health mapped
    /// onto the instance's health fields.
    async fn discover_instances(&self, key: &ServiceKey) -> GatewayResult<Vec<ServiceInstance>>;

    async fn update_instance_health(
        &self,
        key: &ServiceKey,
        instance_id: &str,
        status: HealthStatus,
    ) -> GatewayResult<()>;

    /// Release the underlying connection.
    async fn close(&self);
}
