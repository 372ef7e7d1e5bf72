//! One client's complete configuration: every resource kind, built together.

use std::collections::{BTreeMap, BTreeSet};

use envoy_types::pb::envoy::config::cluster::v3::{
    cluster::{ClusterDiscoveryType, DiscoveryType},
    Cluster,
};
use envoy_types::pb::envoy::config::listener::v3::{filter, Listener};
use envoy_types::pb::envoy::config::route::v3::{
    route, route_action::ClusterSpecifier, RouteConfiguration,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::RouteSpecifier, HttpConnectionManager,
};
use prost::Message;

use super::builders::{BuiltResource, ResourceKind};
use super::policy::HTTP_CONNECTION_MANAGER_TYPE_URL;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    resources: BTreeMap<ResourceKind, Vec<BuiltResource>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the resources of one kind.
    pub fn insert(&mut self, kind: ResourceKind, resources: Vec<BuiltResource>) {
        self.resources.insert(kind, resources);
    }

    pub fn resources(&self, kind: ResourceKind) -> &[BuiltResource] {
        self.resources.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn names(&self, kind: ResourceKind) -> Vec<&str> {
        self.resources(kind).iter().map(|r| r.name.as_str()).collect()
    }

    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.resources.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.resources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn decode<M: Message + Default>(&self, kind: ResourceKind) -> Result<Vec<M>> {
        self.resources(kind).iter().map(|r| r.decode::<M>()).collect()
    }

    /// Verify cross-kind references: listeners point at existing route
    /// configurations, routes at existing clusters, and every EDS cluster has
    /// a load assignment.
    pub fn check_consistency(&self) -> Result<()> {
        let routes: BTreeSet<&str> = self.names(ResourceKind::Route).into_iter().collect();
        let clusters: BTreeSet<&str> = self.names(ResourceKind::Cluster).into_iter().collect();
        let assignments: BTreeSet<&str> = self.names(ResourceKind::Endpoint).into_iter().collect();

        for listener in self.decode::<Listener>(ResourceKind::Listener)? {
            for name in rds_names(&listener)? {
                if !routes.contains(name.as_str()) {
                    return Err(Error::internal(format!(
                        "Listener '{}' references missing route configuration '{}'",
                        listener.name, name
                    )));
                }
            }
        }

        for config in self.decode::<RouteConfiguration>(ResourceKind::Route)? {
            for cluster in route_clusters(&config) {
                if !clusters.contains(cluster.as_str()) {
                    return Err(Error::internal(format!(
                        "Route configuration '{}' references missing cluster '{}'",
                        config.name, cluster
                    )));
                }
            }
        }

        for cluster in self.decode::<Cluster>(ResourceKind::Cluster)? {
            let eds = cluster.cluster_discovery_type
                == Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32));
            if eds && !assignments.contains(cluster.name.as_str()) {
                return Err(Error::internal(format!(
                    "EDS cluster '{}' has no load assignment",
                    cluster.name
                )));
            }
        }

        Ok(())
    }
}

fn rds_names(listener: &Listener) -> Result<Vec<String>> {
    let chains = listener.filter_chains.iter().chain(listener.default_filter_chain.as_ref());
    let mut names = Vec::new();
    for chain in chains {
        for f in &chain.filters {
            let Some(filter::ConfigType::TypedConfig(any)) = &f.config_type else {
                continue;
            };
            if any.type_url != HTTP_CONNECTION_MANAGER_TYPE_URL {
                continue;
            }
            let hcm = HttpConnectionManager::decode(&*any.value)?;
            if let Some(RouteSpecifier::Rds(rds)) = hcm.route_specifier {
                names.push(rds.route_config_name);
            }
        }
    }
    Ok(names)
}

fn route_clusters(config: &RouteConfiguration) -> Vec<String> {
    config
        .virtual_hosts
        .iter()
        .flat_map(|vh| vh.routes.iter())
        .filter_map(|r| match r.action.as_ref()? {
            route::Action::Route(action) => action.cluster_specifier.as_ref(),
            _ => None,
        })
        .flat_map(|specifier| match specifier {
            ClusterSpecifier::Cluster(name) => vec![name.clone()],
            ClusterSpecifier::WeightedClusters(weighted) => {
                weighted.clusters.iter().map(|c| c.name.clone()).collect()
            }
            _ => Vec::new(),
        })
        .collect()
}
