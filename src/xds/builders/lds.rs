//! Listener discovery.
//!
//! One listener per traffic direction the client's role needs, bound at the
//! direction's fixed port. The filter-chain layout follows the requested TLS
//! mode; see [`chain_layout`].

use std::sync::Arc;

use async_trait::async_trait;
use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType, socket_address::PortSpecifier,
    socket_address::Protocol, Address, SocketAddress,
};
use envoy_types::pb::envoy::config::listener::v3::{
    filter, Filter, FilterChain, FilterChainMatch, Listener,
};
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::{CodecType, RouteSpecifier},
    http_filter, HttpConnectionManager, HttpFilter, Rds,
};
use tracing::debug;

use super::{Binding, BuiltResource, ResourceBuilder, ResourceKind};
use crate::config::{TlsSecretConfig, XdsConfig};
use crate::registry::ServiceRegistry;
use crate::xds::context::{BuildOption, TrafficDirection, XdsClient};
use crate::xds::policy::{
    self, chain_layout, PlaintextChain, BindPortPolicy, HTTP_CONNECTION_MANAGER,
    HTTP_CONNECTION_MANAGER_TYPE_URL, PASSTHROUGH_FILTER_CHAIN_TLS, PLAINTEXT_FILTER_CHAIN,
    RAW_BUFFER_TRANSPORT_PROTOCOL, ROUTER, ROUTER_TYPE_URL, TLS_TRANSPORT_PROTOCOL,
};
use crate::Result;

/// Connection manager carrying the role- and direction-specific routing payload.
///
/// Gateways always get the outbound payload; sidecars get one scoped to their
/// own service and the requested direction.
pub fn bound_http_connection_manager(
    client: &XdsClient,
    direction: TrafficDirection,
) -> Result<HttpConnectionManager> {
    let direction = if client.is_gateway() { TrafficDirection::Outbound } else { direction };
    let route_config_name = policy::route_config_name(client, direction)?;

    Ok(HttpConnectionManager {
        stat_prefix: format!("{}_HTTP", direction.as_str()),
        codec_type: CodecType::Auto as i32,
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            config_source: Some(policy::ads_config_source()),
            route_config_name,
        })),
        http_filters: vec![HttpFilter {
            name: ROUTER.to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(policy::typed_config(
                ROUTER_TYPE_URL,
                &Router::default(),
            ))),
            ..Default::default()
        }],
        ..Default::default()
    })
}

fn application_filter(hcm: &HttpConnectionManager) -> Filter {
    Filter {
        name: HTTP_CONNECTION_MANAGER.to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(policy::typed_config(
            HTTP_CONNECTION_MANAGER_TYPE_URL,
            hcm,
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct LdsBuilder {
    ports: BindPortPolicy,
    listener_address: String,
    secrets: TlsSecretConfig,
    binding: Binding,
}

impl LdsBuilder {
    pub fn new(config: &XdsConfig) -> Self {
        Self {
            ports: config.bind_ports.clone(),
            listener_address: config.listener_address.clone(),
            secrets: config.tls_secrets.clone(),
            binding: Binding::default(),
        }
    }

    /// Assemble the listener for one direction.
    pub fn make_listener(
        &self,
        option: &BuildOption,
        direction: TrafficDirection,
    ) -> Result<Listener> {
        let (client, _) = self.binding.get(ResourceKind::Listener)?;

        let hcm = bound_http_connection_manager(client, direction)?;
        let mut listener = self.base_listener(direction, &hcm)?;
        listener.listener_filters.extend(policy::default_listener_filters());

        let layout = chain_layout(option.tls_mode);
        if layout.tls_chain {
            let tls_chain = FilterChain {
                name: PASSTHROUGH_FILTER_CHAIN_TLS.to_string(),
                filter_chain_match: Some(FilterChainMatch {
                    transport_protocol: TLS_TRANSPORT_PROTOCOL.to_string(),
                    ..Default::default()
                }),
                transport_socket: Some(policy::downstream_tls_transport_socket(&self.secrets)),
                filters: vec![application_filter(&hcm)],
                ..Default::default()
            };

            match layout.plaintext_chain {
                PlaintextChain::Unmatched => {}
                PlaintextChain::RawBuffer => {
                    for chain in &mut listener.filter_chains {
                        chain.filter_chain_match = Some(FilterChainMatch {
                            transport_protocol: RAW_BUFFER_TRANSPORT_PROTOCOL.to_string(),
                            ..Default::default()
                        });
                    }
                }
                PlaintextChain::Absent => listener.filter_chains.clear(),
            }
            listener.filter_chains.push(tls_chain);
        }

        if layout.tls_detection {
            let mut filters = policy::tls_detection_filters();
            filters.append(&mut listener.listener_filters);
            listener.listener_filters = filters;
        }

        if !layout.default_chain {
            listener.default_filter_chain = None;
        }

        Ok(listener)
    }

    fn base_listener(
        &self,
        direction: TrafficDirection,
        hcm: &HttpConnectionManager,
    ) -> Result<Listener> {
        let port = self.ports.port_for(direction)?;

        Ok(Listener {
            name: policy::listener_name(direction, port),
            traffic_direction: direction.as_envoy() as i32,
            address: Some(Address {
                address: Some(AddressType::SocketAddress(SocketAddress {
                    protocol: Protocol::Tcp as i32,
                    address: self.listener_address.clone(),
                    port_specifier: Some(PortSpecifier::PortValue(port)),
                    ..Default::default()
                })),
            }),
            filter_chains: vec![FilterChain {
                name: PLAINTEXT_FILTER_CHAIN.to_string(),
                filters: vec![application_filter(hcm)],
                ..Default::default()
            }],
            default_filter_chain: Some(policy::passthrough_filter_chain()),
            listener_filters: Vec::new(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl ResourceBuilder for LdsBuilder {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Listener
    }

    fn init(&mut self, client: Arc<XdsClient>, registry: Arc<dyn ServiceRegistry>) {
        self.binding.bind(client, registry);
    }

    async fn generate(&self, option: &BuildOption) -> Result<Vec<BuiltResource>> {
        let (client, _) = self.binding.get(ResourceKind::Listener)?;

        let mut resources = Vec::new();
        for direction in policy::directions_for(client.run_type) {
            let listener = self.make_listener(option, *direction)?;
            let name = listener.name.clone();
            resources.push(BuiltResource::new(name, ResourceKind::Listener, &listener));
        }

        debug!(
            node_id = %client.node_id,
            tls_mode = %option.tls_mode,
            listeners = resources.len(),
            "Built listener resources"
        );
        Ok(resources)
    }
}
