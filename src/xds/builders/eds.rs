//! Endpoint discovery: one `ClusterLoadAssignment` per visible service,
//! carrying only routable instances grouped by locality.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType, socket_address::PortSpecifier, Address, HealthStatus,
    Locality as EnvoyLocality, SocketAddress,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::google::protobuf::UInt32Value;
use futures::future::try_join_all;
use tracing::debug;

use super::{Binding, BuiltResource, ResourceBuilder, ResourceKind};
use crate::domain::{Locality, ServiceInstance};
use crate::registry::ServiceRegistry;
use crate::xds::context::{BuildOption, XdsClient};
use crate::xds::policy;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct EdsBuilder {
    binding: Binding,
}

impl EdsBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lb_endpoint(instance: &ServiceInstance) -> LbEndpoint {
    let socket_address = SocketAddress {
        address: instance.host.clone(),
        port_specifier: Some(PortSpecifier::PortValue(instance.port)),
        ..Default::default()
    };
    let endpoint = Endpoint {
        address: Some(Address { address: Some(AddressType::SocketAddress(socket_address)) }),
        ..Default::default()
    };

    LbEndpoint {
        host_identifier: Some(HostIdentifier::Endpoint(endpoint)),
        health_status: HealthStatus::Healthy as i32,
        load_balancing_weight: Some(UInt32Value { value: instance.weight }),
        ..Default::default()
    }
}

fn load_assignment(cluster_name: String, instances: &[ServiceInstance]) -> ClusterLoadAssignment {
    let mut by_locality: BTreeMap<&Locality, Vec<&ServiceInstance>> = BTreeMap::new();
    for instance in instances.iter().filter(|instance| instance.is_routable()) {
        by_locality.entry(&instance.locality).or_default().push(instance);
    }

    let endpoints = by_locality
        .into_iter()
        .map(|(locality, mut members)| {
            members.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
            LocalityLbEndpoints {
                locality: Some(EnvoyLocality {
                    region: locality.region.clone(),
                    zone: locality.zone.clone(),
                    sub_zone: locality.campus.clone(),
                }),
                lb_endpoints: members.into_iter().map(lb_endpoint).collect(),
                ..Default::default()
            }
        })
        .collect();

    ClusterLoadAssignment { cluster_name, endpoints, ..Default::default() }
}

#[async_trait]
impl ResourceBuilder for EdsBuilder {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Endpoint
    }

    fn init(&mut self, client: Arc<XdsClient>, registry: Arc<dyn ServiceRegistry>) {
        self.binding.bind(client, registry);
    }

    async fn generate(&self, _option: &BuildOption) -> Result<Vec<BuiltResource>> {
        let (client, registry) = self.binding.get(ResourceKind::Endpoint)?;
        let services = registry.visible_services(&client.visibility()).await?;

        let instances =
            try_join_all(services.iter().map(|service| registry.healthy_instances(&service.key)))
                .await?;

        let mut resources: Vec<BuiltResource> = services
            .iter()
            .zip(instances)
            .map(|(service, instances)| {
                let name = policy::cluster_name(&service.key);
                let assignment = load_assignment(name.clone(), &instances);
                BuiltResource::new(name, ResourceKind::Endpoint, &assignment)
            })
            .collect();
        resources.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(
            node_id = %client.node_id,
            assignments = resources.len(),
            "Built endpoint resources"
        );
        Ok(resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ServiceInstance;
    use crate::registry::InMemoryRegistry;
    use crate::xds::builders::test_support::{self, orders};

    async fn assignments(
        client: Arc<XdsClient>,
        registry: Arc<InMemoryRegistry>,
    ) -> Vec<ClusterLoadAssignment> {
        let mut builder = EdsBuilder::new();
        builder.init(client, registry);
        builder
            .generate(&BuildOption::default())
            .await
            .expect("endpoints build")
            .iter()
            .map(|built| built.decode::<ClusterLoadAssignment>().expect("decode assignment"))
            .collect()
    }

    fn hosts(assignment: &ClusterLoadAssignment) -> Vec<(String, u32)> {
        assignment
            .endpoints
            .iter()
            .flat_map(|group| group.lb_endpoints.iter())
            .filter_map(|lb| match lb.host_identifier.as_ref()? {
                HostIdentifier::Endpoint(endpoint) => {
                    match endpoint.address.as_ref()?.address.as_ref()? {
                        AddressType::SocketAddress(socket) => match socket.port_specifier {
                            Some(PortSpecifier::PortValue(port)) => {
                                Some((socket.address.clone(), port))
                            }
                            _ => None,
                        },
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn only_healthy_instances_are_published() {
        let assignments = assignments(test_support::sidecar(), test_support::registry()).await;
        let names: Vec<_> = assignments.iter().map(|a| a.cluster_name.as_str()).collect();
        assert_eq!(names, vec!["default|orders", "default|payments"]);
        assert_eq!(hosts(&assignments[0]), vec![("10.0.0.1".to_string(), 8080)]);
        assert_eq!(
            assignments[0].endpoints[0].lb_endpoints[0].load_balancing_weight,
            Some(UInt32Value { value: 100 })
        );
    }

    #[tokio::test]
    async fn service_without_instances_gets_empty_assignment() {
        let registry = test_support::registry();
        registry.set_instances(&orders(), Vec::new());
        let assignments = assignments(test_support::sidecar(), registry).await;
        assert_eq!(assignments[0].cluster_name, "default|orders");
        assert!(assignments[0].endpoints.is_empty());
    }

    #[tokio::test]
    async fn instances_group_by_locality_in_stable_order() {
        let registry = test_support::registry();
        let east = Locality { region: "us".into(), zone: "east".into(), campus: "a".into() };
        let west = Locality { region: "us".into(), zone: "west".into(), campus: String::new() };
        registry.set_instances(
            &orders(),
            vec![
                ServiceInstance::new("w-1", "10.1.0.9", 8080).with_locality(west.clone()),
                ServiceInstance::new("e-2", "10.2.0.2", 8080).with_locality(east.clone()),
                ServiceInstance::new("e-1", "10.2.0.1", 8080).with_locality(east.clone()),
                ServiceInstance::new("e-3", "10.2.0.3", 8080).with_locality(east).isolated(),
            ],
        );

        let assignments = assignments(test_support::sidecar(), registry).await;
        let orders = &assignments[0];
        assert_eq!(orders.endpoints.len(), 2);
        let first = orders.endpoints[0].locality.as_ref().unwrap();
        assert_eq!((first.zone.as_str(), first.sub_zone.as_str()), ("east", "a"));
        assert_eq!(
            hosts(orders),
            vec![
                ("10.2.0.1".to_string(), 8080),
                ("10.2.0.2".to_string(), 8080),
                ("10.1.0.9".to_string(), 8080)
            ]
        );
    }

    #[tokio::test]
    async fn health_changes_show_up_on_next_generate() {
        let registry = test_support::registry();
        let mut builder = EdsBuilder::new();
        builder.init(test_support::sidecar(), registry.clone());

        let before = builder.generate(&BuildOption::default()).await.unwrap();
        registry.set_instance_health(&orders(), "o-2", true);
        let after = builder.generate(&BuildOption::default()).await.unwrap();

        let orders_after = after[0].decode::<ClusterLoadAssignment>().unwrap();
        assert_ne!(before[0], after[0]);
        assert_eq!(hosts(&orders_after).len(), 2);
    }

    #[tokio::test]
    async fn gateway_gets_assignments_for_exposed_services_only() {
        let assignments = assignments(test_support::gateway(), test_support::registry()).await;
        let names: Vec<_> = assignments.iter().map(|a| a.cluster_name.as_str()).collect();
        assert_eq!(names, vec!["default|payments"]);
    }
}
