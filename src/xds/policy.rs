//! Security and transport policy.
//!
//! Pure functions deciding listener-filter sets, TLS transport sockets, the
//! filter-chain layout per TLS mode, bind ports, and resource names. The
//! names and literals here are part of the configuration surface the proxy
//! expects and must not drift.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::{
    config_source::ConfigSourceSpecifier, transport_socket::ConfigType as TransportSocketConfigType,
    AggregatedConfigSource, ApiVersion, ConfigSource, TransportSocket,
};
use envoy_types::pb::envoy::config::listener::v3::{
    filter, listener_filter, Filter, FilterChain, ListenerFilter,
};
use envoy_types::pb::envoy::extensions::filters::listener::http_inspector::v3::HttpInspector;
use envoy_types::pb::envoy::extensions::filters::listener::original_dst::v3::OriginalDst;
use envoy_types::pb::envoy::extensions::filters::listener::tls_inspector::v3::TlsInspector;
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{
    tcp_proxy::ClusterSpecifier, TcpProxy,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context::ValidationContextType, CommonTlsContext, DownstreamTlsContext,
    SdsSecretConfig, UpstreamTlsContext,
};
use envoy_types::pb::google::protobuf::{Any, BoolValue};
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::config::TlsSecretConfig;
use crate::domain::{ServiceKey, TlsMode};
use crate::xds::context::{RunType, TrafficDirection, XdsClient};
use crate::{Error, Result};

pub const HTTP_INSPECTOR: &str = "envoy.filters.listener.http_inspector";
pub const TLS_INSPECTOR: &str = "envoy.filters.listener.tls_inspector";
pub const ORIGINAL_DST: &str = "envoy.filters.listener.original_dst";
pub const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
pub const TCP_PROXY: &str = "envoy.filters.network.tcp_proxy";
pub const ROUTER: &str = "envoy.filters.http.router";
pub const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";

pub const TLS_TRANSPORT_PROTOCOL: &str = "tls";
pub const RAW_BUFFER_TRANSPORT_PROTOCOL: &str = "raw_buffer";

pub const PASSTHROUGH_CLUSTER: &str = "PassthroughCluster";
pub const BLACKHOLE_CLUSTER: &str = "BlackHoleCluster";
pub const PASSTHROUGH_FILTER_CHAIN: &str = "PassthroughFilterChain";
pub const PASSTHROUGH_FILTER_CHAIN_TLS: &str = "PassthroughFilterChain-TLS";
pub const PLAINTEXT_FILTER_CHAIN: &str = "PlaintextFilterChain";

pub const HTTP_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.http_inspector.v3.HttpInspector";
pub const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
pub const ORIGINAL_DST_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.original_dst.v3.OriginalDst";
pub const HTTP_CONNECTION_MANAGER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
pub const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
pub const ROUTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
pub const DOWNSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
pub const UPSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";

/// Wrap a message as a typed `Any`.
pub fn typed_config<M: Message>(type_url: &str, message: &M) -> Any {
    Any { type_url: type_url.to_string(), value: message.encode_to_vec() }
}

/// Immutable direction to bind-port table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindPortPolicy {
    ports: BTreeMap<TrafficDirection, u32>,
}

impl Default for BindPortPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INBOUND_PORT, Self::DEFAULT_OUTBOUND_PORT)
    }
}

impl BindPortPolicy {
    pub const DEFAULT_INBOUND_PORT: u32 = 15006;
    pub const DEFAULT_OUTBOUND_PORT: u32 = 15001;

    pub fn new(inbound: u32, outbound: u32) -> Self {
        Self::from_table([
            (TrafficDirection::Inbound, inbound),
            (TrafficDirection::Outbound, outbound),
        ])
    }

    /// Build from an explicit table; directions left out have no port.
    pub fn from_table(entries: impl IntoIterator<Item = (TrafficDirection, u32)>) -> Self {
        Self { ports: entries.into_iter().collect() }
    }

    pub fn port_for(&self, direction: TrafficDirection) -> Result<u32> {
        self.ports.get(&direction).copied().ok_or_else(|| {
            Error::config(format!("No bind port configured for {} traffic", direction))
        })
    }

    /// Ports must be valid and directions must not share one.
    pub fn check(&self) -> Result<()> {
        let mut seen = BTreeMap::new();
        for (direction, port) in &self.ports {
            if *port == 0 || *port > u32::from(u16::MAX) {
                return Err(Error::config(format!(
                    "Bind port {} for {} traffic is out of range",
                    port, direction
                )));
            }
            if let Some(other) = seen.insert(*port, *direction) {
                return Err(Error::config(format!(
                    "{} and {} traffic cannot share bind port {}",
                    other, direction, port
                )));
            }
        }
        Ok(())
    }
}

/// `<TRAFFIC_DIRECTION_NAME>_<bindPort>`
pub fn listener_name(direction: TrafficDirection, port: u32) -> String {
    format!("{}_{}", direction.as_str(), port)
}

pub fn cluster_name(key: &ServiceKey) -> String {
    format!("{}|{}", key.namespace, key.name)
}

/// Name of the route configuration a client's connection manager loads for `direction`.
pub fn route_config_name(client: &XdsClient, direction: TrafficDirection) -> Result<String> {
    match client.run_type {
        RunType::Gateway => Ok(format!("{}|gateway", TrafficDirection::Outbound.as_str())),
        RunType::Sidecar => {
            let key = client.self_service()?;
            Ok(format!("{}|{}|{}", direction.as_str(), key.namespace, key.name))
        }
    }
}

/// Directions a role needs listeners and route configurations for.
pub fn directions_for(run_type: RunType) -> &'static [TrafficDirection] {
    match run_type {
        RunType::Gateway => &[TrafficDirection::Outbound],
        RunType::Sidecar => &[TrafficDirection::Inbound, TrafficDirection::Outbound],
    }
}

/// How the application chain that carries plaintext traffic is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaintextChain {
    /// Single chain with no match criteria.
    Unmatched,
    /// Matched on the `raw_buffer` transport protocol reported by TLS detection.
    RawBuffer,
    /// No plaintext application chain.
    Absent,
}

/// Filter-chain shape of a listener for one TLS mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLayout {
    pub plaintext_chain: PlaintextChain,
    pub tls_chain: bool,
    pub tls_detection: bool,
    pub default_chain: bool,
}

pub fn chain_layout(mode: TlsMode) -> ChainLayout {
    match mode {
        TlsMode::None => ChainLayout {
            plaintext_chain: PlaintextChain::Unmatched,
            tls_chain: false,
            tls_detection: false,
            default_chain: true,
        },
        TlsMode::Permissive => ChainLayout {
            plaintext_chain: PlaintextChain::RawBuffer,
            tls_chain: true,
            tls_detection: true,
            default_chain: true,
        },
        TlsMode::Strict => ChainLayout {
            plaintext_chain: PlaintextChain::Absent,
            tls_chain: true,
            tls_detection: true,
            default_chain: false,
        },
    }
}

fn listener_filter<M: Message>(name: &str, type_url: &str, message: &M) -> ListenerFilter {
    ListenerFilter {
        name: name.to_string(),
        config_type: Some(listener_filter::ConfigType::TypedConfig(typed_config(
            type_url, message,
        ))),
        ..Default::default()
    }
}

/// Protocol detection filters; they must run before every other listener filter.
pub fn tls_detection_filters() -> Vec<ListenerFilter> {
    vec![
        listener_filter(HTTP_INSPECTOR, HTTP_INSPECTOR_TYPE_URL, &HttpInspector::default()),
        listener_filter(TLS_INSPECTOR, TLS_INSPECTOR_TYPE_URL, &TlsInspector::default()),
    ]
}

/// Filters every listener carries regardless of TLS mode.
pub fn default_listener_filters() -> Vec<ListenerFilter> {
    vec![listener_filter(ORIGINAL_DST, ORIGINAL_DST_TYPE_URL, &OriginalDst::default())]
}

pub fn ads_config_source() -> ConfigSource {
    ConfigSource {
        resource_api_version: ApiVersion::V3 as i32,
        config_source_specifier: Some(ConfigSourceSpecifier::Ads(
            AggregatedConfigSource::default(),
        )),
        ..Default::default()
    }
}

fn sds_secret(name: &str) -> SdsSecretConfig {
    SdsSecretConfig {
        name: name.to_string(),
        sds_config: Some(ads_config_source()),
        ..Default::default()
    }
}

/// Workload certificate and trust bundle, both delivered over SDS.
pub fn common_tls_context(secrets: &TlsSecretConfig) -> CommonTlsContext {
    CommonTlsContext {
        tls_certificate_sds_secret_configs: vec![sds_secret(&secrets.certificate_secret)],
        validation_context_type: Some(ValidationContextType::ValidationContextSdsSecretConfig(
            sds_secret(&secrets.root_ca_secret),
        )),
        ..Default::default()
    }
}

/// Server-side mutual TLS: the peer must present a client certificate.
pub fn downstream_tls_transport_socket(secrets: &TlsSecretConfig) -> TransportSocket {
    let context = DownstreamTlsContext {
        common_tls_context: Some(common_tls_context(secrets)),
        require_client_certificate: Some(BoolValue { value: true }),
        ..Default::default()
    };
    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(typed_config(
            DOWNSTREAM_TLS_CONTEXT_TYPE_URL,
            &context,
        ))),
    }
}

/// Client-side mutual TLS toward an upstream service.
pub fn upstream_tls_transport_socket(secrets: &TlsSecretConfig, sni: &str) -> TransportSocket {
    let context = UpstreamTlsContext {
        common_tls_context: Some(common_tls_context(secrets)),
        sni: sni.to_string(),
        ..Default::default()
    };
    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(typed_config(
            UPSTREAM_TLS_CONTEXT_TYPE_URL,
            &context,
        ))),
    }
}

/// Baseline chain: plain TCP proxy to the original destination.
pub fn passthrough_filter_chain() -> FilterChain {
    let tcp_proxy = TcpProxy {
        stat_prefix: PASSTHROUGH_CLUSTER.to_string(),
        cluster_specifier: Some(ClusterSpecifier::Cluster(PASSTHROUGH_CLUSTER.to_string())),
        ..Default::default()
    };
    FilterChain {
        name: PASSTHROUGH_FILTER_CHAIN.to_string(),
        filters: vec![Filter {
            name: TCP_PROXY.to_string(),
            config_type: Some(filter::ConfigType::TypedConfig(typed_config(
                TCP_PROXY_TYPE_URL,
                &tcp_proxy,
            ))),
        }],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_table_matches_well_known_ports() {
        let ports = BindPortPolicy::default();
        assert_eq!(ports.port_for(TrafficDirection::Inbound).unwrap(), 15006);
        assert_eq!(ports.port_for(TrafficDirection::Outbound).unwrap(), 15001);
        assert!(ports.check().is_ok());
    }

    #[test]
    fn missing_direction_is_a_config_error() {
        let ports = BindPortPolicy::from_table([(TrafficDirection::Outbound, 15001)]);
        let err = ports.port_for(TrafficDirection::Inbound).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn shared_or_zero_ports_fail_check() {
        assert!(BindPortPolicy::new(15001, 15001).check().is_err());
        assert!(BindPortPolicy::new(0, 15001).check().is_err());
        assert!(BindPortPolicy::new(70000, 15001).check().is_err());
    }

    #[test]
    fn listener_names_follow_direction_and_port() {
        assert_eq!(listener_name(TrafficDirection::Inbound, 15006), "INBOUND_15006");
        assert_eq!(listener_name(TrafficDirection::Outbound, 15001), "OUTBOUND_15001");
    }

    #[test]
    fn chain_layout_decision_table() {
        let cases = [
            (TlsMode::None, PlaintextChain::Unmatched, false, false, true),
            (TlsMode::Permissive, PlaintextChain::RawBuffer, true, true, true),
            (TlsMode::Strict, PlaintextChain::Absent, true, true, false),
        ];
        for (mode, plaintext, tls_chain, detection, default_chain) in cases {
            let layout = chain_layout(mode);
            assert_eq!(layout.plaintext_chain, plaintext, "{mode}");
            assert_eq!(layout.tls_chain, tls_chain, "{mode}");
            assert_eq!(layout.tls_detection, detection, "{mode}");
            assert_eq!(layout.default_chain, default_chain, "{mode}");
        }
    }

    #[test]
    fn detection_filters_are_http_then_tls_inspector() {
        let names: Vec<_> = tls_detection_filters().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec![HTTP_INSPECTOR, TLS_INSPECTOR]);
        let defaults: Vec<_> = default_listener_filters().into_iter().map(|f| f.name).collect();
        assert_eq!(defaults, vec![ORIGINAL_DST]);
    }

    #[test]
    fn downstream_socket_requires_client_certificate() {
        let socket = downstream_tls_transport_socket(&TlsSecretConfig::default());
        assert_eq!(socket.name, TLS_TRANSPORT_SOCKET);
        let any = match socket.config_type {
            Some(TransportSocketConfigType::TypedConfig(any)) => any,
            None => panic!("missing typed config"),
        };
        assert_eq!(any.type_url, DOWNSTREAM_TLS_CONTEXT_TYPE_URL);
        let context = DownstreamTlsContext::decode(&*any.value).unwrap();
        assert_eq!(context.require_client_certificate, Some(BoolValue { value: true }));
        let common = context.common_tls_context.unwrap();
        assert_eq!(common.tls_certificate_sds_secret_configs[0].name, "default");
        match common.validation_context_type {
            Some(ValidationContextType::ValidationContextSdsSecretConfig(sds)) => {
                assert_eq!(sds.name, "ROOTCA")
            }
            other => panic!("unexpected validation context: {:?}", other),
        }
    }

    #[test]
    fn route_config_names_per_role() {
        let sidecar = XdsClient::sidecar("n1", ServiceKey::new("default", "orders"));
        assert_eq!(
            route_config_name(&sidecar, TrafficDirection::Inbound).unwrap(),
            "INBOUND|default|orders"
        );
        let gateway = XdsClient::gateway("gw", "edge");
        assert_eq!(
            route_config_name(&gateway, TrafficDirection::Outbound).unwrap(),
            "OUTBOUND|gateway"
        );
    }
}
