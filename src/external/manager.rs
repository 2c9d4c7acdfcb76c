//! External registry cache manager.
//!
//! Maps a composite service key to a lazily-created registry client selected
//! by `RegistryType`. A client is fully torn down (closed and evicted) when
//! its service is deregistered so stale external connections never
//! accumulate.

use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{HealthStatus, RegistryType, Service, ServiceInstance, ServiceKey};
use crate::external::{ConsulClient, ExternalRegistryClient, ExternalRegistryConfig};

struct ClientEntry {
    client: Arc<dyn ExternalRegistryClient>,
    registry_type: RegistryType,
}

pub struct ExternalRegistryManager {
    clients: DashMap<ServiceKey, ClientEntry>,
    configs: DashMap<RegistryType, ExternalRegistryConfig>,
}

impl ExternalRegistryManager {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            configs: DashMap::new(),
        }
    }

    /// Store the configuration for one backend type and push it to every
    /// existing client of that type. Clients diff the configuration's content
    /// hash and re-initialize their connection only when it changed.
    pub async fn set_config(
        &self,
        registry_type: RegistryType,
        config: ExternalRegistryConfig,
    ) -> GatewayResult<()> {
        self.configs.insert(registry_type, config.clone());

        let affected: Vec<Arc<dyn ExternalRegistryClient>> = self
            .clients
            .iter()
            .filter(|entry| entry.registry_type == registry_type)
            .map(|entry| Arc::clone(&entry.client))
            .collect();
        for client in affected {
            client.apply_config(&config).await?;
        }
        info!(registry_type = %registry_type, "external registry configuration applied");
        Ok(())
    }

    /// Client for a service, created lazily on first use.
    fn get_or_create_client(
        &self,
        key: &ServiceKey,
        registry_type: RegistryType,
    ) -> GatewayResult<Arc<dyn ExternalRegistryClient>> {
        if let Some(entry) = self.clients.get(key) {
            return Ok(Arc::clone(&entry.client));
        }

        let client: Arc<dyn ExternalRegistryClient> = match registry_type {
            RegistryType::Consul => {
                let config = self.configs.get(&RegistryType::Consul).ok_or_else(|| {
                    GatewayError::config("no consul registry configuration set")
                })?;
                Arc::new(ConsulClient::new(&config)?)
            }
            RegistryType::Internal => {
                return Err(GatewayError::internal(
                    "internal services do not use an external registry client",
                ))
            }
            other => {
                return Err(GatewayError::unsupported(format!(
                    "{other} registry client"
                )))
            }
        };

        let entry = self
            .clients
            .entry(key.clone())
            .or_insert_with(|| ClientEntry {
                client: Arc::clone(&client),
                registry_type,
            });
        debug!(service = %key, registry_type = %registry_type, "created external registry client");
        Ok(Arc::clone(&entry.client))
    }

    pub async fn register_service(&self, service: &Service) -> GatewayResult<()> {
        let client = self.get_or_create_client(&service.key(), service.registry_type)?;
        client.register_service(service).await
    }

    /// Deregister a service and tear its client down completely: disconnect,
    /// then evict, so no stale connection lingers for a deleted service.
    pub async fn deregister_service(
        &self,
        key: &ServiceKey,
        registry_type: RegistryType,
    ) -> GatewayResult<()> {
        let client = match self.clients.remove(key) {
            Some((_, entry)) => entry.client,
            None => self.get_or_create_client(key, registry_type)?,
        };
        let result = client.deregister_service(key).await;
        client.close().await;
        self.clients.remove(key);
        debug!(service = %key, "external registry client torn down");
        result
    }

    pub async fn register_instance(
        &self,
        key: &ServiceKey,
        registry_type: RegistryType,
        instance: &ServiceInstance,
    ) -> GatewayResult<()> {
        let client = self.get_or_create_client(key, registry_type)?;
        client.register_instance(key, instance).await
    }

    pub async fn deregister_instance(
        &self,
        key: &ServiceKey,
        registry_type: RegistryType,
        instance_id: &str,
    ) -> GatewayResult<()> {
        let client = self.get_or_create_client(key, registry_type)?;
        client.deregister_instance(key, instance_id).await
    }

    pub async fn update_instance(
        &self,
        key: &ServiceKey,
        registry_type: RegistryType,
        instance: &ServiceInstance,
    ) -> GatewayResult<()> {
        let client = self.get_or_create_client(key, registry_type)?;
        client.update_instance(key, instance).await
    }

    pub async fn update_instance_health(
        &self,
        key: &ServiceKey,
        registry_type: RegistryType,
        instance_id: &str,
        status: HealthStatus,
    ) -> GatewayResult<()> {
        let client = self.get_or_create_client(key, registry_type)?;
        client.update_instance_health(key, instance_id, status).await
    }

    pub async fn discover_instances(
        &self,
        key: &ServiceKey,
        registry_type: RegistryType,
    ) -> GatewayResult<Vec<ServiceInstance>> {
        let client = self.get_or_create_client(key, registry_type)?;
        client.discover_instances(key).await
    }

    /// One available instance of an externally-registered service, picked
    /// uniformly at random; external registries own their instances' health.
    pub async fn discover_healthy_instance(
        &self,
        key: &ServiceKey,
        registry_type: RegistryType,
    ) -> GatewayResult<ServiceInstance> {
        let instances = self.discover_instances(key, registry_type).await?;
        if instances.is_empty() {
            return Err(GatewayError::NoInstances);
        }
        let available: Vec<&ServiceInstance> =
            instances.iter().filter(|i| i.is_available()).collect();
        if available.is_empty() {
            return Err(GatewayError::NoHealthyInstances);
        }
        let index = rand::thread_rng().gen_range(0..available.len());
        Ok(available[index].clone())
    }

    /// Number of live external clients (diagnostics).
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Close and drop every client; used by `RegistryCache::clear`.
    pub async fn close_all(&self) {
        let entries: Vec<Arc<dyn ExternalRegistryClient>> = self
            .clients
            .iter()
            .map(|entry| Arc::clone(&entry.client))
            .collect();
        for client in entries {
            client.close().await;
        }
        self.clients.clear();
        debug!("all external registry clients closed");
    }
}

impl Default for ExternalRegistryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_backend_is_explicit() {
        let manager = ExternalRegistryManager::new();
        let key = ServiceKey::new("t1", "g1", "users");

        let err = manager
            .discover_instances(&key, RegistryType::Etcd)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_consul_without_config_is_a_config_error() {
        let manager = ExternalRegistryManager::new();
        let key = ServiceKey::new("t1", "g1", "users");

        let err = manager
            .discover_instances(&key, RegistryType::Consul)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }
}
