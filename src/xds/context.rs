//! Per-connection build context.
//!
//! An [`XdsClient`] is created once when a proxy identifies itself and stays
//! immutable for the lifetime of its connection. [`BuildOption`] carries the
//! per-push parameters and may change between pushes for the same client.

use std::fmt;

use envoy_types::pb::envoy::config::core::v3::{
    node::UserAgentVersionType, Node, TrafficDirection as EnvoyTrafficDirection,
};
use envoy_types::pb::google::protobuf::{value::Kind, Struct};
use serde::{Deserialize, Serialize};

use crate::domain::{ServiceKey, TlsMode};
use crate::registry::Visibility;
use crate::{Error, Result};

pub const METADATA_RUN_TYPE: &str = "flowmesh.io/run-type";
pub const METADATA_SERVICE_NAMESPACE: &str = "flowmesh.io/service-namespace";
pub const METADATA_SERVICE_NAME: &str = "flowmesh.io/service-name";
pub const METADATA_TLS_MODE: &str = "flowmesh.io/tls-mode";

/// Deployment role of a connected proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    /// Attached to one workload; handles its inbound and outbound traffic.
    Sidecar,
    /// Edge proxy; handles outbound-style traffic only.
    Gateway,
}

impl RunType {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "sidecar" => Ok(RunType::Sidecar),
            "gateway" => Ok(RunType::Gateway),
            other => Err(Error::config(format!("Unknown proxy run type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficDirection {
    Inbound,
    Outbound,
}

impl TrafficDirection {
    pub fn as_envoy(&self) -> EnvoyTrafficDirection {
        match self {
            TrafficDirection::Inbound => EnvoyTrafficDirection::Inbound,
            TrafficDirection::Outbound => EnvoyTrafficDirection::Outbound,
        }
    }

    /// Wire name, e.g. `INBOUND`.
    pub fn as_str(&self) -> &'static str {
        self.as_envoy().as_str_name()
    }
}

impl fmt::Display for TrafficDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one connected proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XdsClient {
    pub node_id: String,
    pub run_type: RunType,
    /// Namespace the proxy runs in.
    pub namespace: String,
    /// The workload a sidecar is attached to. Always `None` for gateways.
    pub self_service: Option<ServiceKey>,
    /// TLS mode the proxy asked for in its node metadata.
    pub requested_tls_mode: Option<TlsMode>,
    pub ip: Option<String>,
    pub user_agent: String,
    pub user_agent_version: String,
}

impl XdsClient {
    pub fn sidecar(node_id: impl Into<String>, self_service: ServiceKey) -> Self {
        Self {
            node_id: node_id.into(),
            run_type: RunType::Sidecar,
            namespace: self_service.namespace.clone(),
            self_service: Some(self_service),
            requested_tls_mode: None,
            ip: None,
            user_agent: String::new(),
            user_agent_version: String::new(),
        }
    }

    pub fn gateway(node_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            run_type: RunType::Gateway,
            namespace: namespace.into(),
            self_service: None,
            requested_tls_mode: None,
            ip: None,
            user_agent: String::new(),
            user_agent_version: String::new(),
        }
    }

    pub fn with_requested_tls_mode(mut self, mode: TlsMode) -> Self {
        self.requested_tls_mode = Some(mode);
        self
    }

    /// Build a client from the `Node` a proxy sends with its first request.
    ///
    /// Node ids look like `<namespace>/<uuid>~<ip>`; role, self service and
    /// TLS mode come from node metadata. A sidecar without a self service is
    /// accepted here and rejected when its listeners are generated.
    pub fn from_node(node: &Node) -> Result<Self> {
        if node.id.trim().is_empty() {
            return Err(Error::config("Node id cannot be empty"));
        }

        let (id_namespace, ip) = split_node_id(&node.id);
        let metadata = node.metadata.as_ref();

        let run_type = RunType::parse(metadata_string(metadata, METADATA_RUN_TYPE).unwrap_or(""))?;
        let requested_tls_mode = metadata_string(metadata, METADATA_TLS_MODE)
            .map(str::parse::<TlsMode>)
            .transpose()?;

        let service_namespace = metadata_string(metadata, METADATA_SERVICE_NAMESPACE)
            .map(str::to_string)
            .or_else(|| id_namespace.clone())
            .unwrap_or_default();
        let service_name = metadata_string(metadata, METADATA_SERVICE_NAME).unwrap_or_default();

        let self_service = match run_type {
            RunType::Gateway => None,
            RunType::Sidecar if service_name.is_empty() => None,
            RunType::Sidecar => Some(ServiceKey::new(service_namespace.clone(), service_name)),
        };

        let user_agent_version = match &node.user_agent_version_type {
            Some(UserAgentVersionType::UserAgentVersion(version)) => version.clone(),
            _ => String::new(),
        };

        Ok(Self {
            node_id: node.id.clone(),
            run_type,
            namespace: id_namespace.unwrap_or(service_namespace),
            self_service,
            requested_tls_mode,
            ip,
            user_agent: node.user_agent_name.clone(),
            user_agent_version,
        })
    }

    pub fn is_gateway(&self) -> bool {
        self.run_type == RunType::Gateway
    }

    /// The sidecar's own service; a configuration error when absent or blank.
    pub fn self_service(&self) -> Result<&ServiceKey> {
        match &self.self_service {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(Error::config(format!(
                "Sidecar node '{}' has no self-service identity",
                self.node_id
            ))),
        }
    }

    pub fn visibility(&self) -> Visibility {
        match self.run_type {
            RunType::Gateway => Visibility::Gateway,
            RunType::Sidecar => Visibility::Mesh(
                self.self_service
                    .as_ref()
                    .map(|key| key.namespace.clone())
                    .unwrap_or_else(|| self.namespace.clone()),
            ),
        }
    }
}

fn split_node_id(id: &str) -> (Option<String>, Option<String>) {
    let (namespace, rest) = match id.split_once('/') {
        Some((ns, rest)) if !ns.is_empty() => (Some(ns.to_string()), rest),
        _ => (None, id),
    };
    let ip = rest.split_once('~').map(|(_, ip)| ip.to_string()).filter(|ip| !ip.is_empty());
    (namespace, ip)
}

fn metadata_string<'a>(metadata: Option<&'a Struct>, key: &str) -> Option<&'a str> {
    match metadata?.fields.get(key)?.kind.as_ref()? {
        Kind::StringValue(value) => Some(value.as_str()),
        _ => None,
    }
}

/// Per-push synthesis parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOption {
    pub tls_mode: TlsMode,
}

impl BuildOption {
    pub fn new(tls_mode: TlsMode) -> Self {
        Self { tls_mode }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::google::protobuf::Value;

    fn node(id: &str, metadata: &[(&str, &str)]) -> Node {
        let fields = metadata
            .iter()
            .map(|(k, v)| {
                (k.to_string(), Value { kind: Some(Kind::StringValue(v.to_string())) })
            })
            .collect();
        Node {
            id: id.to_string(),
            metadata: Some(Struct { fields }),
            user_agent_name: "envoy".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn sidecar_node_carries_self_service() {
        let client = XdsClient::from_node(&node(
            "default/7c9e~10.1.2.3",
            &[(METADATA_SERVICE_NAME, "orders"), (METADATA_TLS_MODE, "strict")],
        ))
        .unwrap();

        assert_eq!(client.run_type, RunType::Sidecar);
        assert_eq!(client.namespace, "default");
        assert_eq!(client.ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(client.self_service().unwrap(), &ServiceKey::new("default", "orders"));
        assert_eq!(client.requested_tls_mode, Some(TlsMode::Strict));
        assert_eq!(client.visibility(), Visibility::Mesh("default".into()));
    }

    #[test]
    fn gateway_node_has_no_self_service() {
        let client = XdsClient::from_node(&node(
            "edge/gw-1",
            &[(METADATA_RUN_TYPE, "gateway"), (METADATA_SERVICE_NAME, "ignored")],
        ))
        .unwrap();

        assert!(client.is_gateway());
        assert!(client.self_service.is_none());
        assert_eq!(client.visibility(), Visibility::Gateway);
    }

    #[test]
    fn sidecar_without_service_fails_on_lookup() {
        let client = XdsClient::from_node(&node("default/abc", &[])).unwrap();
        let err = client.self_service().unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn invalid_metadata_is_rejected() {
        assert!(XdsClient::from_node(&node("", &[])).is_err());
        assert!(XdsClient::from_node(&node("a/b", &[(METADATA_RUN_TYPE, "router")])).is_err());
        assert!(XdsClient::from_node(&node("a/b", &[(METADATA_TLS_MODE, "maybe")])).is_err());
    }

    #[test]
    fn direction_names_match_wire_names() {
        assert_eq!(TrafficDirection::Inbound.as_str(), "INBOUND");
        assert_eq!(TrafficDirection::Outbound.as_str(), "OUTBOUND");
    }
}
