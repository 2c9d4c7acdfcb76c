//! Consul registry client.
//!
//! Speaks Consul's agent and health HTTP APIs directly over `reqwest`.
//! Services are namespaced as `{tenant}-{group}-{service}` so tenants cannot
//! collide inside one Consul datacenter; tenant and group also travel in the
//! service metadata for reverse mapping during discovery.
//!
//! The client holds its connection behind an `RwLock` and rebuilds it when
//! `apply_config` observes a changed configuration hash. Requests issued
//! during the swap wait on the lock; that brief window is tolerated by
//! callers, not masked here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{HealthStatus, Service, ServiceInstance, ServiceKey};
use crate::external::{ExternalRegistryClient, ExternalRegistryConfig};

const META_TENANT: &str = "gateway-tenant";
const META_GROUP: &str = "gateway-group";
const META_SERVICE: &str = "gateway-service";

struct ConsulConn {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    config_hash: String,
}

pub struct ConsulClient {
    conn: RwLock<ConsulConn>,
}

/// Consul agent service registration payload.
#[derive(Debug, Serialize)]
struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Meta")]
    meta: HashMap<String, String>,
    #[serde(rename = "Weights")]
    weights: ServiceWeights,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServiceWeights {
    #[serde(rename = "Passing")]
    passing: u32,
    #[serde(rename = "Warning")]
    warning: u32,
}

/// One entry of Consul's `/v1/health/service/{name}` response.
#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: HealthEntryService,
    #[serde(rename = "Checks", default)]
    checks: Vec<HealthCheck>,
}

#[derive(Debug, Deserialize)]
struct HealthEntryService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
    #[serde(rename = "Weights")]
    weights: Option<ServiceWeights>,
}

#[derive(Debug, Deserialize)]
struct HealthCheck {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Serialize)]
struct CheckUpdate {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Output")]
    output: String,
}

impl ConsulClient {
    pub fn new(config: &ExternalRegistryConfig) -> GatewayResult<Self> {
        Ok(Self {
            conn: RwLock::new(Self::build_conn(config)?),
        })
    }

    fn build_conn(config: &ExternalRegistryConfig) -> GatewayResult<ConsulConn> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::config(format!("failed to build consul client: {e}")))?;
        Ok(ConsulConn {
            http,
            base_url: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            config_hash: config.content_hash(),
        })
    }

    /// Consul service name for a registry key.
    fn consul_name(key: &ServiceKey) -> String {
        format!("{}-{}-{}", key.tenant_id, key.group_id, key.service)
    }

    async fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let conn = self.conn.read().await;
        let mut builder = conn
            .http
            .request(method, format!("{}{}", conn.base_url, path));
        if let Some(token) = &conn.token {
            builder = builder.header("X-Consul-Token", token.clone());
        }
        builder
    }

    async fn expect_success(
        response: reqwest::Response,
        operation: &str,
    ) -> GatewayResult<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(GatewayError::external(format!(
                "{operation} failed with status {status}: {body}"
            )))
        }
    }

    fn registration_for(key: &ServiceKey, instance: &ServiceInstance) -> AgentServiceRegistration {
        let mut meta = HashMap::new();
        meta.insert(META_TENANT.to_string(), key.tenant_id.clone());
        meta.insert(META_GROUP.to_string(), key.group_id.clone());
        meta.insert(META_SERVICE.to_string(), key.service.clone());
        AgentServiceRegistration {
            id: instance.instance_id.clone(),
            name: Self::consul_name(key),
            address: instance.host.clone(),
            port: instance.port,
            meta,
            weights: ServiceWeights {
                passing: instance.weight.max(1),
                warning: 1,
            },
        }
    }

    async fn put_registration(
        &self,
        registration: &AgentServiceRegistration,
    ) -> GatewayResult<()> {
        let response = self
            .request(reqwest::Method::PUT, "/v1/agent/service/register")
            .await
            .json(registration)
            .send()
            .await?;
        Self::expect_success(response, "consul service register").await?;
        Ok(())
    }
}

#[async_trait]
impl ExternalRegistryClient for ConsulClient {
    async fn apply_config(&self, config: &ExternalRegistryConfig) -> GatewayResult<()> {
        let new_hash = config.content_hash();
        {
            let conn = self.conn.read().await;
            if conn.config_hash == new_hash {
                return Ok(());
            }
        }
        // Hash changed: build the replacement first, then swap under the
        // write lock. Dropping the old connection releases it.
        let replacement = Self::build_conn(config)?;
        let mut conn = self.conn.write().await;
        *conn = replacement;
        info!(address = %config.address, "consul connection re-initialized after config change");
        Ok(())
    }

    async fn register_service(&self, service: &Service) -> GatewayResult<()> {
        let key = service.key();
        for instance in &service.instances {
            self.put_registration(&Self::registration_for(&key, instance))
                .await?;
        }
        debug!(service = %key, instances = service.instances.len(), "registered service in consul");
        Ok(())
    }

    async fn deregister_service(&self, key: &ServiceKey) -> GatewayResult<()> {
        // Consul has no service-level delete; deregister each live instance.
        let instances = self.discover_instances(key).await?;
        for instance in &instances {
            if let Err(err) = self.deregister_instance(key, &instance.instance_id).await {
                warn!(
                    service = %key,
                    instance_id = %instance.instance_id,
                    error = %err,
                    "failed to deregister instance during service teardown"
                );
            }
        }
        debug!(service = %key, "deregistered service from consul");
        Ok(())
    }

    async fn register_instance(
        &self,
        key: &ServiceKey,
        instance: &ServiceInstance,
    ) -> GatewayResult<()> {
        self.put_registration(&Self::registration_for(key, instance))
            .await?;
        debug!(service = %key, instance_id = %instance.instance_id, "registered instance in consul");
        Ok(())
    }

    async fn deregister_instance(&self, key: &ServiceKey, instance_id: &str) -> GatewayResult<()> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/v1/agent/service/deregister/{instance_id}"),
            )
            .await
            .send()
            .await?;
        Self::expect_success(response, "consul service deregister").await?;
        debug!(service = %key, instance_id, "deregistered instance from consul");
        Ok(())
    }

    async fn update_instance(
        &self,
        key: &ServiceKey,
        instance: &ServiceInstance,
    ) -> GatewayResult<()> {
        // Registration is an upsert in Consul.
        self.register_instance(key, instance).await
    }

    async fn discover_services(&self) -> GatewayResult<Vec<String>> {
        let response = self
            .request(reqwest::Method::GET, "/v1/catalog/services")
            .await
            .send()
            .await?;
        let response = Self::expect_success(response, "consul catalog list").await?;
        let services: HashMap<String, Vec<String>> = response.json().await?;
        Ok(services.into_keys().collect())
    }

    async fn discover_instances(&self, key: &ServiceKey) -> GatewayResult<Vec<ServiceInstance>> {
        let name = Self::consul_name(key);
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/health/service/{name}"),
            )
            .await
            .send()
            .await?;
        let response = Self::expect_success(response, "consul health query").await?;
        let entries: Vec<HealthEntry> = response.json().await?;

        let mut instances = Vec::with_capacity(entries.len());
        for entry in entries {
            let tenant_id = entry
                .service
                .meta
                .get(META_TENANT)
                .cloned()
                .unwrap_or_else(|| key.tenant_id.clone());
            let weight = entry
                .service
                .weights
                .map(|w| w.passing.max(1))
                .unwrap_or(1);
            let instance = ServiceInstance::new(
                tenant_id,
                entry.service.id,
                entry.service.address,
                entry.service.port,
            )
            .with_weight(weight);

            let passing = !entry.checks.is_empty()
                && entry.checks.iter().all(|c| c.status == "passing");
            if !passing && !entry.checks.is_empty() {
                instance.record_health(HealthStatus::Unhealthy);
            }
            instances.push(instance);
        }
        debug!(service = %key, count = instances.len(), "discovered consul instances");
        Ok(instances)
    }

    async fn update_instance_health(
        &self,
        key: &ServiceKey,
        instance_id: &str,
        status: HealthStatus,
    ) -> GatewayResult<()> {
        let update = CheckUpdate {
            status: match status {
                HealthStatus::Healthy => "passing".to_string(),
                HealthStatus::Unhealthy => "critical".to_string(),
            },
            output: format!("gateway health update for {key}"),
        };
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/v1/agent/check/update/service:{instance_id}"),
            )
            .await
            .json(&update)
            .send()
            .await?;
        Self::expect_success(response, "consul check update").await?;
        Ok(())
    }

    async fn close(&self) {
        // reqwest connections are pooled and released on drop; nothing to
        // tear down eagerly beyond logging the lifecycle event.
        let conn = self.conn.read().await;
        debug!(address = %conn.base_url, "consul client closed");
    }
}
