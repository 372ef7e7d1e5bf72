//! # Service Registry
//!
//! The registry is the only shared mutable resource the xDS builders touch.
//! Builders query it through [`ServiceRegistry`]; queries are side-effect free
//! and safe to run concurrently for different clients.

mod memory;

pub use memory::{InMemoryRegistry, RegistryEvent, RegistrySeed, ServiceSeed};

use async_trait::async_trait;

use crate::domain::{RoutingRule, Service, ServiceInstance, ServiceKey};
use crate::Result;

/// Which slice of the registry a client may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// A sidecar in the given namespace sees every service exported to it.
    Mesh(String),
    /// An edge gateway sees the services exposed to gateways.
    Gateway,
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync + std::fmt::Debug {
    /// Services reachable under `visibility`, ordered by key.
    async fn visible_services(&self, visibility: &Visibility) -> Result<Vec<Service>>;

    /// The registered service `key`, if any.
    async fn service(&self, key: &ServiceKey) -> Result<Option<Service>>;

    /// Instances of `key` currently marked healthy and routable.
    async fn healthy_instances(&self, key: &ServiceKey) -> Result<Vec<ServiceInstance>>;

    /// Routing rules owned by `key`, ordered by priority.
    async fn routing_rules(&self, key: &ServiceKey) -> Result<Vec<RoutingRule>>;
}
