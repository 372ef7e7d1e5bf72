use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Identity of a registered service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// A key with an empty namespace or name does not identify anything.
    pub fn is_empty(&self) -> bool {
        self.namespace.trim().is_empty() || self.name.trim().is_empty()
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Mutual-TLS posture, used both per service and per synthesis request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// No TLS listener filters or transport sockets.
    #[default]
    None,
    /// Plaintext and mutual-TLS traffic are both accepted.
    Permissive,
    /// Only mutual-TLS traffic is accepted.
    Strict,
}

impl TlsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::None => "none",
            TlsMode::Permissive => "permissive",
            TlsMode::Strict => "strict",
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, TlsMode::None)
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TlsMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "disable" | "disabled" => Ok(TlsMode::None),
            "permissive" => Ok(TlsMode::Permissive),
            "strict" => Ok(TlsMode::Strict),
            other => Err(Error::config(format!("Unknown TLS mode '{}'", other))),
        }
    }
}

/// A registered service and the policy attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(flatten)]
    pub key: ServiceKey,

    /// Free-form metadata; `lb_policy` selects the cluster load balancer.
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Namespaces allowed to see this service; empty means every namespace.
    #[serde(default)]
    pub export_to: Vec<String>,

    /// Whether edge gateways route to this service.
    #[serde(default)]
    pub gateway_exposed: bool,

    /// Mutual-TLS policy of the service's own workloads.
    #[serde(default)]
    pub tls_mode: TlsMode,
}

impl Service {
    pub fn new(key: ServiceKey) -> Self {
        Self {
            key,
            metadata: HashMap::new(),
            export_to: Vec::new(),
            gateway_exposed: false,
            tls_mode: TlsMode::None,
        }
    }

    pub fn with_gateway_exposure(mut self, exposed: bool) -> Self {
        self.gateway_exposed = exposed;
        self
    }

    pub fn with_tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls_mode = mode;
        self
    }

    pub fn with_export_to<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.export_to = namespaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Mesh visibility from a workload in `namespace`.
    pub fn is_visible_from(&self, namespace: &str) -> bool {
        self.export_to.is_empty()
            || self.export_to.iter().any(|ns| ns == "*" || ns == namespace)
            || self.key.namespace == namespace
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Locality {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub campus: String,
}

fn default_weight() -> u32 {
    100
}

fn default_healthy() -> bool {
    true
}

/// One live instance of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub host: String,
    pub port: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default)]
    pub isolated: bool,
    #[serde(default)]
    pub locality: Locality,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u32) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: default_weight(),
            healthy: true,
            isolated: false,
            locality: Locality::default(),
        }
    }

    pub fn with_health(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }

    /// Healthy, not isolated and carrying traffic weight.
    pub fn is_routable(&self) -> bool {
        self.healthy && !self.isolated && self.weight > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_mode_parses_known_values() {
        assert_eq!("strict".parse::<TlsMode>().unwrap(), TlsMode::Strict);
        assert_eq!(" Permissive ".parse::<TlsMode>().unwrap(), TlsMode::Permissive);
        assert_eq!("".parse::<TlsMode>().unwrap(), TlsMode::None);
        assert!("mutual".parse::<TlsMode>().is_err());
    }

    #[test]
    fn export_to_limits_visibility() {
        let open = Service::new(ServiceKey::new("shop", "orders"));
        assert!(open.is_visible_from("billing"));

        let scoped = open.clone().with_export_to(["billing"]);
        assert!(scoped.is_visible_from("billing"));
        assert!(scoped.is_visible_from("shop"));
        assert!(!scoped.is_visible_from("search"));

        let wildcard = open.with_export_to(["*"]);
        assert!(wildcard.is_visible_from("search"));
    }

    #[test]
    fn routable_instances_exclude_unhealthy_isolated_and_weightless() {
        let base = ServiceInstance::new("i-1", "10.0.0.1", 8080);
        assert!(base.is_routable());
        assert!(!base.clone().with_health(false).is_routable());
        assert!(!base.clone().isolated().is_routable());
        assert!(!base.with_weight(0).is_routable());
    }

    #[test]
    fn service_deserializes_with_defaults() {
        let yaml = "namespace: default\nname: orders\n";
        let service: Service = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(service.key, ServiceKey::new("default", "orders"));
        assert_eq!(service.tls_mode, TlsMode::None);
        assert!(!service.gateway_exposed);
    }
}
