//! Cluster discovery: one EDS cluster per service visible to the client, plus
//! the passthrough and black-hole clusters listeners and routes fall back to.

use std::sync::Arc;

use async_trait::async_trait;
use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, DiscoveryType, EdsClusterConfig, LbPolicy,
};
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::google::protobuf::Duration;
use tracing::{debug, warn};

use super::{Binding, BuiltResource, ResourceBuilder, ResourceKind};
use crate::config::{TlsSecretConfig, XdsConfig};
use crate::domain::Service;
use crate::registry::ServiceRegistry;
use crate::xds::context::{BuildOption, XdsClient};
use crate::xds::policy::{self, BLACKHOLE_CLUSTER, PASSTHROUGH_CLUSTER};
use crate::Result;

#[derive(Debug, Clone)]
pub struct CdsBuilder {
    connect_timeout_seconds: u64,
    secrets: TlsSecretConfig,
    binding: Binding,
}

impl CdsBuilder {
    pub fn new(config: &XdsConfig) -> Self {
        Self {
            connect_timeout_seconds: config.connect_timeout_seconds,
            secrets: config.tls_secrets.clone(),
            binding: Binding::default(),
        }
    }

    fn connect_timeout(&self) -> Option<Duration> {
        Some(Duration { seconds: self.connect_timeout_seconds as i64, nanos: 0 })
    }

    fn service_cluster(&self, service: &Service, option: &BuildOption) -> Cluster {
        let name = policy::cluster_name(&service.key);
        let transport_socket = if option.tls_mode.is_enabled() && service.tls_mode.is_enabled() {
            let sni = format!("{}.{}", service.key.name, service.key.namespace);
            Some(policy::upstream_tls_transport_socket(&self.secrets, &sni))
        } else {
            None
        };

        Cluster {
            name: name.clone(),
            connect_timeout: self.connect_timeout(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
            eds_cluster_config: Some(EdsClusterConfig {
                eds_config: Some(policy::ads_config_source()),
                service_name: name,
            }),
            lb_policy: map_lb_policy(service) as i32,
            transport_socket,
            ..Default::default()
        }
    }

    fn passthrough_cluster(&self) -> Cluster {
        Cluster {
            name: PASSTHROUGH_CLUSTER.to_string(),
            connect_timeout: self.connect_timeout(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(
                DiscoveryType::OriginalDst as i32,
            )),
            lb_policy: LbPolicy::ClusterProvided as i32,
            ..Default::default()
        }
    }

    fn blackhole_cluster(&self) -> Cluster {
        Cluster {
            name: BLACKHOLE_CLUSTER.to_string(),
            connect_timeout: self.connect_timeout(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Static as i32)),
            load_assignment: Some(ClusterLoadAssignment {
                cluster_name: BLACKHOLE_CLUSTER.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn map_lb_policy(service: &Service) -> LbPolicy {
    let Some(value) = service.metadata.get("lb_policy") else {
        return LbPolicy::RoundRobin;
    };
    match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "round_robin" => LbPolicy::RoundRobin,
        "least_request" => LbPolicy::LeastRequest,
        "random" => LbPolicy::Random,
        "ring_hash" => LbPolicy::RingHash,
        "maglev" => LbPolicy::Maglev,
        other => {
            warn!(
                service = %service.key,
                lb_policy = other,
                "Unknown lb_policy, using ROUND_ROBIN"
            );
            LbPolicy::RoundRobin
        }
    }
}

#[async_trait]
impl ResourceBuilder for CdsBuilder {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Cluster
    }

    fn init(&mut self, client: Arc<XdsClient>, registry: Arc<dyn ServiceRegistry>) {
        self.binding.bind(client, registry);
    }

    async fn generate(&self, option: &BuildOption) -> Result<Vec<BuiltResource>> {
        let (client, registry) = self.binding.get(ResourceKind::Cluster)?;
        let services = registry.visible_services(&client.visibility()).await?;

        let mut clusters: Vec<Cluster> =
            services.iter().map(|service| self.service_cluster(service, option)).collect();
        clusters.push(self.passthrough_cluster());
        clusters.push(self.blackhole_cluster());
        clusters.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(node_id = %client.node_id, clusters = clusters.len(), "Built cluster resources");
        Ok(clusters
            .iter()
            .map(|cluster| BuiltResource::new(cluster.name.clone(), ResourceKind::Cluster, cluster))
            .collect())
    }
}
