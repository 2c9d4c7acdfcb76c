//! # Registry Cache
//!
//! Concurrency-safe CRUD over the tenant → group → service → instance
//! hierarchy, plus instance discovery dispatching to either local
//! health-aware load balancing or an external registry client.
//!
//! ## Copy-on-write discipline
//!
//! Each tenant's group map is stored as `Arc<HashMap<..>>`. Mutations clone
//! the map, apply the change, and atomically store a new `Arc` through the
//! DashMap entry, so concurrent readers observe either the old or the new
//! snapshot, never a partial one. Writers to the same tenant serialize on the
//! entry's shard lock.
//!
//! The instance index is updated in lockstep but not in the same atomic step
//! as the tree; every lookup path treats a stale index hit as cause for index
//! cleanup rather than as a correctness violation.
//!
//! `update_instance_health` deliberately bypasses copy-on-write: instance
//! health lives in a shared atomic cell, so the flip is visible through every
//! snapshot without replacing the tree.

use dashmap::DashMap;
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{
    HealthStatus, RegistryStats, RequestContext, Service, ServiceGroup, ServiceInstance,
    ServiceKey,
};
use crate::external::ExternalRegistryManager;
use crate::load_balancing::LoadBalancerFactory;

/// Reverse-lookup entry: where one instance lives in the tenant tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLocation {
    pub tenant_id: String,
    pub group_id: String,
    pub service: String,
}

impl InstanceLocation {
    fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.tenant_id, &self.group_id, &self.service)
    }
}

pub struct RegistryCache {
    /// tenant id → immutable snapshot of that tenant's group map.
    tenants: DashMap<String, Arc<HashMap<String, ServiceGroup>>>,
    /// instance id → tree location, for O(1) reverse lookup.
    instance_index: DashMap<String, InstanceLocation>,
    balancers: Arc<LoadBalancerFactory>,
    external: Arc<ExternalRegistryManager>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self::with_collaborators(
            Arc::new(LoadBalancerFactory::new()),
            Arc::new(ExternalRegistryManager::new()),
        )
    }

    pub fn with_collaborators(
        balancers: Arc<LoadBalancerFactory>,
        external: Arc<ExternalRegistryManager>,
    ) -> Self {
        Self {
            tenants: DashMap::new(),
            instance_index: DashMap::new(),
            balancers,
            external,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn external_registry(&self) -> &Arc<ExternalRegistryManager> {
        &self.external
    }

    pub fn balancer_factory(&self) -> &Arc<LoadBalancerFactory> {
        &self.balancers
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!("registry_cache_hits").increment(1);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!("registry_cache_misses").increment(1);
    }

    /// Clone-mutate-swap one tenant's group map. The entry guard serializes
    /// writers to the tenant; the `Arc` store is the atomic swap readers see.
    fn update_tenant<F>(&self, tenant_id: &str, mutate: F)
    where
        F: FnOnce(&mut HashMap<String, ServiceGroup>),
    {
        let mut entry = self
            .tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(HashMap::new()));
        let mut next = (**entry).clone();
        mutate(&mut next);
        *entry = Arc::new(next);
    }

    fn tenant_snapshot(&self, tenant_id: &str) -> Option<Arc<HashMap<String, ServiceGroup>>> {
        self.tenants.get(tenant_id).map(|e| Arc::clone(&e))
    }

    // ---- service groups -------------------------------------------------

    /// Insert or replace a service group, re-indexing every internal
    /// instance it carries. Services the replacement does not carry forward
    /// are deregistered: their balancer state is dropped and, for external
    /// services, their registry client is torn down.
    pub async fn set_service_group(&self, group: ServiceGroup) -> GatewayResult<()> {
        if group.tenant_id.is_empty() || group.group_id.is_empty() {
            return Err(GatewayError::validation(
                "tenant id and group id are required",
            ));
        }

        // Index entries for instances that existed in the previous version
        // but vanish with this write must go away with it, and so must the
        // balancer/client state of services the replacement drops.
        if let Some(snapshot) = self.tenant_snapshot(&group.tenant_id) {
            if let Some(previous) = snapshot.get(&group.group_id) {
                self.purge_group_index(previous);
                for (name, service) in &previous.services {
                    if !group.services.contains_key(name) {
                        self.balancers.remove_all_load_balancers(&service.key());
                        self.teardown_external(service).await;
                    }
                }
            }
        }
        for service in group.services.values() {
            self.index_service_instances(service);
        }

        let group_id = group.group_id.clone();
        let tenant_id = group.tenant_id.clone();
        self.update_tenant(&tenant_id, |groups| {
            groups.insert(group_id.clone(), group);
        });
        debug!(tenant_id, group_id, "service group stored");
        Ok(())
    }

    pub fn get_service_group(&self, tenant_id: &str, group_id: &str) -> GatewayResult<ServiceGroup> {
        let snapshot = self.tenant_snapshot(tenant_id).ok_or_else(|| {
            self.miss();
            GatewayError::not_found("tenant", tenant_id)
        })?;
        match snapshot.get(group_id) {
            Some(group) => {
                self.hit();
                Ok(group.clone())
            }
            None => {
                self.miss();
                Err(GatewayError::not_found(
                    "service group",
                    format!("{tenant_id}/{group_id}"),
                ))
            }
        }
    }

    /// Delete a group, purging the index entries of all its services'
    /// instances, their balancer state, and the external clients of its
    /// externally-registered services. The tenant entry survives even
    /// when its last group goes away: a tenant with zero groups is not a
    /// missing tenant.
    pub async fn delete_service_group(&self, tenant_id: &str, group_id: &str) -> GatewayResult<()> {
        let snapshot = self
            .tenant_snapshot(tenant_id)
            .ok_or_else(|| GatewayError::not_found("tenant", tenant_id))?;
        let group = snapshot.get(group_id).ok_or_else(|| {
            GatewayError::not_found("service group", format!("{tenant_id}/{group_id}"))
        })?;

        self.purge_group_index(group);
        for service in group.services.values() {
            self.balancers.remove_all_load_balancers(&service.key());
            self.teardown_external(service).await;
        }

        self.update_tenant(tenant_id, |groups| {
            groups.remove(group_id);
        });
        debug!(tenant_id, group_id, "service group deleted");
        Ok(())
    }

    /// All groups of a tenant. A missing tenant is an error; a tenant with
    /// zero groups yields an empty list.
    pub fn list_service_groups(&self, tenant_id: &str) -> GatewayResult<Vec<ServiceGroup>> {
        let snapshot = self
            .tenant_snapshot(tenant_id)
            .ok_or_else(|| GatewayError::not_found("tenant", tenant_id))?;
        Ok(snapshot.values().cloned().collect())
    }

    // ---- services -------------------------------------------------------

    /// Insert or replace a service inside an existing group.
    ///
    /// The instance list is REPLACED with exactly what the caller supplies;
    /// an empty list means the service now has zero instances. For externally
    /// registered services the local write also spawns best-effort
    /// registration against the external client; its failure is logged and
    /// never fails the local operation.
    pub async fn set_service(&self, service: Service) -> GatewayResult<()> {
        if service.tenant_id.is_empty() || service.group_id.is_empty() || service.name.is_empty() {
            return Err(GatewayError::validation(
                "tenant id, group id, and service name are required",
            ));
        }
        let key = service.key();

        let snapshot = self
            .tenant_snapshot(&service.tenant_id)
            .ok_or_else(|| GatewayError::not_found("tenant", &service.tenant_id))?;
        let group = snapshot.get(&service.group_id).ok_or_else(|| {
            GatewayError::not_found(
                "service group",
                format!("{}/{}", service.tenant_id, service.group_id),
            )
        })?;

        // Replace-not-merge: index entries for instances the caller did not
        // carry forward are dropped along with the instances themselves.
        if let Some(previous) = group.services.get(&service.name) {
            self.purge_service_index(previous);
        }
        self.index_service_instances(&service);

        if service.registry_type.is_external() {
            let external = Arc::clone(&self.external);
            let to_register = service.clone();
            tokio::spawn(async move {
                if let Err(err) = external.register_service(&to_register).await {
                    warn!(
                        service = %to_register.key(),
                        error = %err,
                        "external registration failed; local write stands"
                    );
                }
            });
        }

        let name = service.name.clone();
        let tenant_id = service.tenant_id.clone();
        let group_id = service.group_id.clone();
        self.update_tenant(&tenant_id, |groups| {
            if let Some(group) = groups.get_mut(&group_id) {
                group.services.insert(name.clone(), service);
            }
        });
        debug!(service = %key, "service stored");
        Ok(())
    }

    /// Counter-free lookup used by instance paths, which do their own
    /// hit/miss accounting.
    fn lookup_service(&self, key: &ServiceKey) -> Option<Service> {
        self.tenant_snapshot(&key.tenant_id)?
            .get(&key.group_id)
            .and_then(|g| g.services.get(&key.service))
            .cloned()
    }

    pub fn get_service(&self, key: &ServiceKey) -> GatewayResult<Service> {
        match self.lookup_service(key) {
            Some(service) => {
                self.hit();
                Ok(service)
            }
            None => {
                self.miss();
                Err(GatewayError::not_found("service", key.to_string()))
            }
        }
    }

    /// Delete a service: tree removal, index purge, balancer-state drop, and
    /// (for external services) full client teardown.
    pub async fn delete_service(&self, key: &ServiceKey) -> GatewayResult<()> {
        let service = self.get_service(key)?;

        self.purge_service_index(&service);
        self.balancers.remove_all_load_balancers(key);
        self.teardown_external(&service).await;

        self.update_tenant(&key.tenant_id, |groups| {
            if let Some(group) = groups.get_mut(&key.group_id) {
                group.services.remove(&key.service);
            }
        });
        debug!(service = %key, "service deleted");
        Ok(())
    }

    /// All services of a group. A missing group is an error; a group with
    /// zero services yields an empty list.
    pub fn list_services(&self, tenant_id: &str, group_id: &str) -> GatewayResult<Vec<Service>> {
        let snapshot = self
            .tenant_snapshot(tenant_id)
            .ok_or_else(|| GatewayError::not_found("tenant", tenant_id))?;
        let group = snapshot.get(group_id).ok_or_else(|| {
            GatewayError::not_found("service group", format!("{tenant_id}/{group_id}"))
        })?;
        Ok(group.services.values().cloned().collect())
    }

    // ---- instances ------------------------------------------------------

    /// Look an instance up through the reverse index.
    ///
    /// Externally-registered services never resolve here: their instances are
    /// not memory-resident, and a stale index entry pointing at one is purged
    /// on detection.
    pub fn get_instance(&self, instance_id: &str) -> GatewayResult<ServiceInstance> {
        let location = match self.instance_index.get(instance_id) {
            Some(entry) => entry.clone(),
            None => {
                self.miss();
                return Err(GatewayError::not_found("instance", instance_id));
            }
        };

        let service = match self.lookup_service(&location.key()) {
            Some(service) => service,
            None => {
                // Stale index entry: the tree no longer has this service.
                self.instance_index.remove(instance_id);
                self.miss();
                return Err(GatewayError::not_found("instance", instance_id));
            }
        };

        if service.registry_type.is_external() {
            self.instance_index.remove(instance_id);
            self.miss();
            return Err(GatewayError::not_found("instance", instance_id));
        }

        match service
            .instances
            .iter()
            .find(|i| i.instance_id == instance_id)
        {
            Some(instance) => {
                self.hit();
                Ok(instance.clone())
            }
            None => {
                // Instance dropped from the tree but the index write raced.
                self.instance_index.remove(instance_id);
                self.miss();
                Err(GatewayError::not_found("instance", instance_id))
            }
        }
    }

    /// Insert or replace one instance of a service.
    ///
    /// Externally-registered services delegate entirely to the external
    /// client; local state is never touched for them.
    pub async fn set_instance(
        &self,
        key: &ServiceKey,
        instance: ServiceInstance,
    ) -> GatewayResult<()> {
        if instance.instance_id.is_empty() {
            return Err(GatewayError::validation("instance id is required"));
        }
        let service = self.get_service(key)?;

        if service.registry_type.is_external() {
            return self
                .external
                .register_instance(key, service.registry_type, &instance)
                .await;
        }

        self.instance_index.insert(
            instance.instance_id.clone(),
            InstanceLocation {
                tenant_id: key.tenant_id.clone(),
                group_id: key.group_id.clone(),
                service: key.service.clone(),
            },
        );

        let instance_id = instance.instance_id.clone();
        self.update_tenant(&key.tenant_id, |groups| {
            if let Some(service) = groups
                .get_mut(&key.group_id)
                .and_then(|g| g.services.get_mut(&key.service))
            {
                service.instances.retain(|i| i.instance_id != instance_id);
                service.instances.push(instance);
            }
        });
        debug!(service = %key, instance_id, "instance stored");
        Ok(())
    }

    /// Remove one instance, resolved through the index.
    pub async fn delete_instance(&self, instance_id: &str) -> GatewayResult<()> {
        let location = self
            .instance_index
            .get(instance_id)
            .map(|e| e.clone())
            .ok_or_else(|| GatewayError::not_found("instance", instance_id))?;
        let key = location.key();
        let service = match self.lookup_service(&key) {
            Some(service) => service,
            None => {
                self.instance_index.remove(instance_id);
                return Err(GatewayError::not_found("instance", instance_id));
            }
        };

        if service.registry_type.is_external() {
            // Stale entry for an external service: local state holds nothing.
            self.instance_index.remove(instance_id);
            return self
                .external
                .deregister_instance(&key, service.registry_type, instance_id)
                .await;
        }

        self.instance_index.remove(instance_id);
        self.update_tenant(&key.tenant_id, |groups| {
            if let Some(service) = groups
                .get_mut(&key.group_id)
                .and_then(|g| g.services.get_mut(&key.service))
            {
                service.instances.retain(|i| i.instance_id != instance_id);
            }
        });
        debug!(service = %key, instance_id, "instance deleted");
        Ok(())
    }

    /// Instances of a service: shallow copies for internal services, the
    /// external registry's view for external ones.
    pub async fn list_instances(&self, key: &ServiceKey) -> GatewayResult<Vec<ServiceInstance>> {
        let service = self.get_service(key)?;
        if service.registry_type.is_external() {
            return self
                .external
                .discover_instances(key, service.registry_type)
                .await;
        }
        Ok(service.instances.clone())
    }

    /// Select one instance of a service for an in-flight request.
    ///
    /// Internal services hand ALL instances, healthy and unhealthy, to the
    /// per-service balancer; filtering is the balancer's job, and so are the
    /// `NoInstances`/`NoHealthyInstances` failures.
    pub async fn discover_instance(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
    ) -> GatewayResult<ServiceInstance> {
        let service = self.get_service(key)?;

        if service.registry_type.is_external() {
            return self
                .external
                .discover_healthy_instance(key, service.registry_type)
                .await;
        }

        let balancer = self.balancers.get_load_balancer(service.strategy, key);
        balancer.select(ctx, &service.instances).await
    }

    /// Record a health-check result for an instance.
    ///
    /// Internal services: in-place mutation of the shared health cell (status
    /// plus timestamp), deliberately outside copy-on-write, race-free via
    /// atomics. External services own their instances' health, so this is a
    /// no-op for them.
    pub fn update_instance_health(
        &self,
        instance_id: &str,
        status: HealthStatus,
    ) -> GatewayResult<()> {
        let location = self
            .instance_index
            .get(instance_id)
            .map(|e| e.clone())
            .ok_or_else(|| GatewayError::not_found("instance", instance_id))?;
        let service = match self.lookup_service(&location.key()) {
            Some(service) => service,
            None => {
                self.instance_index.remove(instance_id);
                return Err(GatewayError::not_found("instance", instance_id));
            }
        };

        if service.registry_type.is_external() {
            return Ok(());
        }

        match service
            .instances
            .iter()
            .find(|i| i.instance_id == instance_id)
        {
            Some(instance) => {
                instance.record_health(status);
                debug!(instance_id, status = %status, "instance health updated");
                Ok(())
            }
            None => {
                self.instance_index.remove(instance_id);
                Err(GatewayError::not_found("instance", instance_id))
            }
        }
    }

    // ---- maintenance ----------------------------------------------------

    /// Aggregate counts plus hit/miss ratio, by full traversal. Diagnostic
    /// path, not hot path.
    pub fn get_stats(&self) -> RegistryStats {
        let mut groups = 0;
        let mut services = 0;
        let mut instances = 0;
        for tenant in self.tenants.iter() {
            groups += tenant.len();
            for group in tenant.values() {
                services += group.services.len();
                for service in group.services.values() {
                    instances += service.instances.len();
                }
            }
        }
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        RegistryStats {
            tenants: self.tenants.len(),
            groups,
            services,
            instances,
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Drop all tenant state, the instance index, all balancer state, and
    /// close every external registry connection.
    pub async fn clear(&self) {
        self.tenants.clear();
        self.instance_index.clear();
        self.balancers.clear();
        self.external.close_all().await;
        info!("registry cache cleared");
    }

    /// Best-effort external teardown (deregister, close, evict) for a
    /// service removed locally; a no-op for internal services. Failure is
    /// logged and the local removal stands.
    async fn teardown_external(&self, service: &Service) {
        if !service.registry_type.is_external() {
            return;
        }
        if let Err(err) = self
            .external
            .deregister_service(&service.key(), service.registry_type)
            .await
        {
            warn!(
                service = %service.key(),
                error = %err,
                "external deregistration failed; local removal stands"
            );
        }
    }

    // ---- index bookkeeping ----------------------------------------------

    fn index_service_instances(&self, service: &Service) {
        if service.registry_type.is_external() {
            return;
        }
        for instance in &service.instances {
            self.instance_index.insert(
                instance.instance_id.clone(),
                InstanceLocation {
                    tenant_id: service.tenant_id.clone(),
                    group_id: service.group_id.clone(),
                    service: service.name.clone(),
                },
            );
        }
    }

    fn purge_service_index(&self, service: &Service) {
        for instance in &service.instances {
            self.instance_index.remove(&instance.instance_id);
        }
    }

    fn purge_group_index(&self, group: &ServiceGroup) {
        for service in group.services.values() {
            self.purge_service_index(service);
        }
    }

    /// Ids of the instances currently backing a service; feed for balancer
    /// `cleanup_stale_state`.
    pub fn live_instance_ids(&self, key: &ServiceKey) -> GatewayResult<HashSet<String>> {
        let service = self.get_service(key)?;
        Ok(service
            .instances
            .iter()
            .map(|i| i.instance_id.clone())
            .collect())
    }
}

impl Default for RegistryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RegistryType;

    async fn seeded_cache() -> RegistryCache {
        let cache = RegistryCache::new();
        let service = Service::new("t1", "g1", "users", RegistryType::Internal).with_instances(
            vec![
                ServiceInstance::new("t1", "i1", "10.0.0.1", 8080),
                ServiceInstance::new("t1", "i2", "10.0.0.2", 8080),
            ],
        );
        let group = ServiceGroup::new("t1", "g1").with_service(service);
        cache.set_service_group(group).await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_missing_tenant_is_not_empty_tenant() {
        let cache = seeded_cache().await;
        assert!(matches!(
            cache.list_service_groups("ghost"),
            Err(GatewayError::NotFound { .. })
        ));

        cache.delete_service_group("t1", "g1").await.unwrap();
        // Tenant still present with zero groups.
        assert_eq!(cache.list_service_groups("t1").unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_group_delete_purges_instance_index() {
        let cache = seeded_cache().await;
        assert!(cache.get_instance("i1").is_ok());

        cache.delete_service_group("t1", "g1").await.unwrap();
        assert!(matches!(
            cache.get_instance("i1"),
            Err(GatewayError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_service_requires_existing_group() {
        let cache = RegistryCache::new();
        let orphan = Service::new("t1", "g1", "users", RegistryType::Internal);
        assert!(matches!(
            cache.set_service(orphan).await,
            Err(GatewayError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_service_replaces_instances() {
        let cache = seeded_cache().await;
        let key = ServiceKey::new("t1", "g1", "users");

        let replacement = Service::new("t1", "g1", "users", RegistryType::Internal)
            .with_instances(vec![ServiceInstance::new("t1", "i9", "10.0.0.9", 8080)]);
        cache.set_service(replacement).await.unwrap();

        let instances = cache.list_instances(&key).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].instance_id, "i9");
        // Old instances fell out of the index with the replacement.
        assert!(cache.get_instance("i1").is_err());
        assert!(cache.get_instance("i9").is_ok());
    }

    #[tokio::test]
    async fn test_health_update_mutates_in_place() {
        let cache = seeded_cache().await;
        let before = cache.get_instance("i1").unwrap();
        assert!(before.is_available());

        cache
            .update_instance_health("i1", HealthStatus::Unhealthy)
            .unwrap();
        // The copy handed out earlier shares the health cell.
        assert!(!before.is_available());
        assert!(before.last_health_check().is_some());
    }

    #[tokio::test]
    async fn test_stats_traversal() {
        let cache = seeded_cache().await;
        let _ = cache.get_service(&ServiceKey::new("t1", "g1", "users"));
        let _ = cache.get_service(&ServiceKey::new("t1", "g1", "ghost"));

        let stats = cache.get_stats();
        assert_eq!(stats.tenants, 1);
        assert_eq!(stats.groups, 1);
        assert_eq!(stats.services, 1);
        assert_eq!(stats.instances, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
    }
}
