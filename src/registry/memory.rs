use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{ServiceRegistry, Visibility};
use crate::domain::{RoutingRule, Service, ServiceInstance, ServiceKey};
use crate::{Error, Result};

/// Notification that the listed services changed at `revision`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEvent {
    pub revision: u64,
    pub services: Vec<ServiceKey>,
}

/// Seed file format: a list of services with their instances and rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySeed {
    #[serde(default)]
    pub services: Vec<ServiceSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSeed {
    #[serde(flatten)]
    pub service: Service,
    #[serde(default)]
    pub instances: Vec<ServiceInstance>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone)]
struct Entry {
    service: Service,
    instances: Vec<ServiceInstance>,
    rules: Vec<RoutingRule>,
}

/// Read-mostly registry kept in memory. Every mutation bumps the revision and
/// broadcasts a [`RegistryEvent`].
#[derive(Debug)]
pub struct InMemoryRegistry {
    entries: RwLock<BTreeMap<ServiceKey, Entry>>,
    revision: AtomicU64,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self { entries: RwLock::new(BTreeMap::new()), revision: AtomicU64::new(0), events }
    }

    pub fn from_seed(seed: RegistrySeed) -> Self {
        let registry = Self::new();
        for entry in seed.services {
            let key = entry.service.key.clone();
            registry.upsert_service(entry.service);
            registry.set_instances(&key, entry.instances);
            registry.set_routing_rules(&key, entry.routing_rules);
        }
        info!(services = registry.len(), "Registry seeded");
        registry
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let seed: RegistrySeed = serde_yaml::from_str(&raw)?;
        Ok(Self::from_seed(seed))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a service; instances and rules are kept.
    pub fn upsert_service(&self, service: Service) {
        let key = service.key.clone();
        {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            entries
                .entry(key.clone())
                .and_modify(|entry| entry.service = service.clone())
                .or_insert_with(|| Entry { service, instances: Vec::new(), rules: Vec::new() });
        }
        self.notify(vec![key]);
    }

    pub fn remove_service(&self, key: &ServiceKey) -> bool {
        let removed = self.entries.write().expect("registry lock poisoned").remove(key).is_some();
        if removed {
            self.notify(vec![key.clone()]);
        }
        removed
    }

    /// Replace the instance list of a registered service. Unknown services are ignored.
    pub fn set_instances(&self, key: &ServiceKey, instances: Vec<ServiceInstance>) -> bool {
        let updated = {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            match entries.get_mut(key) {
                Some(entry) => {
                    entry.instances = instances;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify(vec![key.clone()]);
        }
        updated
    }

    /// Flip the health flag of one instance, as a health checker would.
    pub fn set_instance_health(&self, key: &ServiceKey, instance_id: &str, healthy: bool) -> bool {
        let updated = {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            entries
                .get_mut(key)
                .and_then(|entry| entry.instances.iter_mut().find(|i| i.id == instance_id))
                .map(|instance| instance.healthy = healthy)
                .is_some()
        };
        if updated {
            self.notify(vec![key.clone()]);
        }
        updated
    }

    pub fn set_routing_rules(&self, key: &ServiceKey, rules: Vec<RoutingRule>) -> bool {
        let updated = {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            match entries.get_mut(key) {
                Some(entry) => {
                    entry.rules = rules;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify(vec![key.clone()]);
        }
        updated
    }

    fn notify(&self, services: Vec<ServiceKey>) {
        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(revision, changed = services.len(), "Registry changed");
        // No subscribers is fine: nothing is connected yet.
        let _ = self.events.send(RegistryEvent { revision, services });
    }

    fn with_entry<T>(&self, key: &ServiceKey, f: impl FnOnce(&Entry) -> T) -> Result<T> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::registry("registry lock poisoned"))?;
        entries
            .get(key)
            .map(f)
            .ok_or_else(|| Error::registry(format!("Service '{}' is not registered", key)))
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryRegistry {
    async fn visible_services(&self, visibility: &Visibility) -> Result<Vec<Service>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::registry("registry lock poisoned"))?;
        let services = entries
            .values()
            .map(|entry| &entry.service)
            .filter(|service| match visibility {
                Visibility::Mesh(namespace) => service.is_visible_from(namespace),
                Visibility::Gateway => service.gateway_exposed,
            })
            .cloned()
            .collect();
        Ok(services)
    }

    async fn service(&self, key: &ServiceKey) -> Result<Option<Service>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::registry("registry lock poisoned"))?;
        Ok(entries.get(key).map(|entry| entry.service.clone()))
    }

    async fn healthy_instances(&self, key: &ServiceKey) -> Result<Vec<ServiceInstance>> {
        self.with_entry(key, |entry| {
            entry.instances.iter().filter(|instance| instance.is_routable()).cloned().collect()
        })
    }

    async fn routing_rules(&self, key: &ServiceKey) -> Result<Vec<RoutingRule>> {
        self.with_entry(key, |entry| {
            let mut rules = entry.rules.clone();
            rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
            rules
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::domain::TlsMode;

    fn orders() -> ServiceKey {
        ServiceKey::new("shop", "orders")
    }

    #[tokio::test]
    async fn healthy_instances_reflect_current_health() {
        let registry = InMemoryRegistry::new();
        registry.upsert_service(Service::new(orders()));
        registry.set_instances(
            &orders(),
            vec![
                ServiceInstance::new("a", "10.0.0.1", 8080),
                ServiceInstance::new("b", "10.0.0.2", 8080),
            ],
        );

        assert_eq!(registry.healthy_instances(&orders()).await.unwrap().len(), 2);

        assert!(registry.set_instance_health(&orders(), "b", false));
        let healthy = registry.healthy_instances(&orders()).await.unwrap();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "a");
    }

    #[tokio::test]
    async fn unknown_service_is_a_registry_error() {
        let registry = InMemoryRegistry::new();
        let err = registry.healthy_instances(&orders()).await.unwrap_err();
        assert!(matches!(err, Error::Registry(_)));
    }

    #[tokio::test]
    async fn service_lookup_returns_registered_policy() {
        let registry = InMemoryRegistry::new();
        assert!(registry.service(&orders()).await.unwrap().is_none());

        registry.upsert_service(Service::new(orders()).with_tls_mode(TlsMode::Strict));
        let service = registry.service(&orders()).await.unwrap().expect("registered");
        assert_eq!(service.tls_mode, TlsMode::Strict);
    }

    #[tokio::test]
    async fn visibility_filters_by_namespace_and_gateway_exposure() {
        let registry = InMemoryRegistry::new();
        registry.upsert_service(Service::new(orders()).with_gateway_exposure(true));
        registry.upsert_service(
            Service::new(ServiceKey::new("internal", "ledger")).with_export_to(["internal"]),
        );

        let mesh = registry.visible_services(&Visibility::Mesh("shop".into())).await.unwrap();
        assert_eq!(mesh.len(), 1);
        assert_eq!(mesh[0].key, orders());

        let internal =
            registry.visible_services(&Visibility::Mesh("internal".into())).await.unwrap();
        assert_eq!(internal.len(), 2);

        let gateway = registry.visible_services(&Visibility::Gateway).await.unwrap();
        assert_eq!(gateway.len(), 1);
    }

    #[tokio::test]
    async fn rules_are_ordered_by_priority() {
        let registry = InMemoryRegistry::new();
        registry.upsert_service(Service::new(orders()));
        registry.set_routing_rules(
            &orders(),
            vec![RoutingRule::new("late").with_priority(5), RoutingRule::new("early")],
        );
        let names: Vec<_> = registry
            .routing_rules(&orders())
            .await
            .unwrap()
            .into_iter()
            .map(|rule| rule.name)
            .collect();
        assert_eq!(names, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn mutations_broadcast_events_with_increasing_revisions() {
        let registry = InMemoryRegistry::new();
        let mut events = registry.subscribe();

        registry.upsert_service(Service::new(orders()));
        registry.set_instances(&orders(), vec![ServiceInstance::new("a", "10.0.0.1", 80)]);
        assert!(!registry.set_instances(&ServiceKey::new("x", "y"), Vec::new()));

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 2);
        assert_eq!(second.services, vec![orders()]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn seed_file_loads_services_instances_and_rules() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
services:
  - namespace: shop
    name: orders
    gateway_exposed: true
    tls_mode: strict
    instances:
      - {{ id: a, host: 10.0.0.1, port: 8080 }}
      - {{ id: b, host: 10.0.0.2, port: 8080, healthy: false }}
    routing_rules:
      - name: all
        path: {{ type: prefix, value: / }}
"#
        )
        .unwrap();

        let registry = InMemoryRegistry::from_yaml_file(file.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.healthy_instances(&orders()).await.unwrap().len(), 1);
        assert_eq!(registry.routing_rules(&orders()).await.unwrap().len(), 1);
    }
}
