//! Route discovery.
//!
//! Route configurations are named exactly as the listeners' connection
//! managers reference them (see [`policy::route_config_name`]), and only
//! reference clusters the client can see.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use envoy_types::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier, route, route_action::ClusterSpecifier,
    route_match::PathSpecifier, weighted_cluster::ClusterWeight, HeaderMatcher, Route,
    RouteAction, RouteConfiguration, RouteMatch, VirtualHost, WeightedCluster,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, RegexMatcher, StringMatcher,
};
use envoy_types::pb::google::protobuf::UInt32Value;
use tracing::{debug, warn};

use super::{Binding, BuiltResource, ResourceBuilder, ResourceKind};
use crate::domain::{PathMatch, RoutingRule, Service, ServiceKey, StringMatch};
use crate::registry::ServiceRegistry;
use crate::xds::context::{BuildOption, RunType, TrafficDirection, XdsClient};
use crate::xds::policy::{self, PASSTHROUGH_CLUSTER};
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct RdsBuilder {
    binding: Binding,
}

impl RdsBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

fn regex(pattern: &str) -> RegexMatcher {
    RegexMatcher { regex: pattern.to_string(), ..Default::default() }
}

fn route_match(rule: &RoutingRule) -> RouteMatch {
    let path_specifier = match &rule.path {
        Some(PathMatch::Exact(path)) => PathSpecifier::Path(path.clone()),
        Some(PathMatch::Prefix(prefix)) => PathSpecifier::Prefix(prefix.clone()),
        Some(PathMatch::Regex(pattern)) => PathSpecifier::SafeRegex(regex(pattern)),
        None => PathSpecifier::Prefix("/".to_string()),
    };

    let headers = rule
        .headers
        .iter()
        .map(|header| {
            let pattern = match &header.matcher {
                StringMatch::Exact(value) => MatchPattern::Exact(value.clone()),
                StringMatch::Prefix(value) => MatchPattern::Prefix(value.clone()),
                StringMatch::Regex(value) => MatchPattern::SafeRegex(regex(value)),
            };
            HeaderMatcher {
                name: header.name.clone(),
                header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(StringMatcher {
                    match_pattern: Some(pattern),
                    ..Default::default()
                })),
                ..Default::default()
            }
        })
        .collect();

    RouteMatch { path_specifier: Some(path_specifier), headers, ..Default::default() }
}

fn forward_to(cluster_specifier: ClusterSpecifier) -> Option<route::Action> {
    Some(route::Action::Route(RouteAction {
        cluster_specifier: Some(cluster_specifier),
        ..Default::default()
    }))
}

fn catch_all(name: &str, cluster: String) -> Route {
    Route {
        name: name.to_string(),
        r#match: Some(RouteMatch {
            path_specifier: Some(PathSpecifier::Prefix("/".to_string())),
            ..Default::default()
        }),
        action: forward_to(ClusterSpecifier::Cluster(cluster)),
        ..Default::default()
    }
}

/// Translate one rule. Destinations the client cannot see are dropped; a rule
/// left without destinations is skipped. A rule with no destinations at all
/// forwards to its owner.
fn rule_route(
    rule: &RoutingRule,
    owner: &ServiceKey,
    visible: &HashSet<&ServiceKey>,
) -> Option<Route> {
    let mut destinations: Vec<(String, u32)> = rule
        .destinations
        .iter()
        .filter(|dest| dest.weight > 0)
        .filter(|dest| {
            let reachable = visible.contains(&dest.service);
            if !reachable {
                warn!(
                    rule = %rule.name,
                    destination = %dest.service,
                    "Dropping destination not visible to client"
                );
            }
            reachable
        })
        .map(|dest| (policy::cluster_name(&dest.service), dest.weight))
        .collect();

    if rule.destinations.is_empty() {
        destinations.push((policy::cluster_name(owner), 100));
    }

    let cluster_specifier = match destinations.len() {
        0 => {
            warn!(
                rule = %rule.name,
                service = %owner,
                "Skipping rule without reachable destinations"
            );
            return None;
        }
        1 => ClusterSpecifier::Cluster(destinations.remove(0).0),
        _ => ClusterSpecifier::WeightedClusters(WeightedCluster {
            clusters: destinations
                .into_iter()
                .map(|(name, weight)| ClusterWeight {
                    name,
                    weight: Some(UInt32Value { value: weight }),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
    };

    Some(Route {
        name: rule.name.clone(),
        r#match: Some(route_match(rule)),
        action: forward_to(cluster_specifier),
        ..Default::default()
    })
}

impl RdsBuilder {
    async fn rule_routes(
        &self,
        registry: &dyn ServiceRegistry,
        service: &Service,
        visible: &HashSet<&ServiceKey>,
    ) -> Result<Vec<Route>> {
        let rules = registry.routing_rules(&service.key).await?;
        Ok(rules.iter().filter_map(|rule| rule_route(rule, &service.key, visible)).collect())
    }

    /// One virtual host per service. Only services in the client's own
    /// namespace answer to their bare name, so domains stay unique when two
    /// namespaces hold a service of the same name.
    async fn sidecar_outbound(
        &self,
        registry: &dyn ServiceRegistry,
        namespace: &str,
        services: &[Service],
    ) -> Result<Vec<VirtualHost>> {
        let visible: HashSet<&ServiceKey> = services.iter().map(|s| &s.key).collect();
        let mut virtual_hosts = Vec::with_capacity(services.len());
        for service in services {
            let cluster = policy::cluster_name(&service.key);
            let mut routes = self.rule_routes(registry, service, &visible).await?;
            routes.push(catch_all("default", cluster.clone()));

            let mut domains = Vec::with_capacity(2);
            if service.key.namespace == namespace {
                domains.push(service.key.name.clone());
            }
            domains.push(format!("{}.{}", service.key.name, service.key.namespace));

            virtual_hosts.push(VirtualHost {
                name: cluster,
                domains,
                routes,
                ..Default::default()
            });
        }
        Ok(virtual_hosts)
    }

    async fn gateway(
        &self,
        registry: &dyn ServiceRegistry,
        services: &[Service],
    ) -> Result<Vec<VirtualHost>> {
        let visible: HashSet<&ServiceKey> = services.iter().map(|s| &s.key).collect();
        let mut routes = Vec::new();
        for service in services {
            routes.extend(self.rule_routes(registry, service, &visible).await?);
        }
        Ok(vec![VirtualHost {
            name: "gateway".to_string(),
            domains: vec!["*".to_string()],
            routes,
            ..Default::default()
        }])
    }

    fn sidecar_inbound(self_service: &ServiceKey) -> Vec<VirtualHost> {
        vec![VirtualHost {
            name: format!("inbound|{}", policy::cluster_name(self_service)),
            domains: vec!["*".to_string()],
            routes: vec![catch_all("inbound", PASSTHROUGH_CLUSTER.to_string())],
            ..Default::default()
        }]
    }
}

#[async_trait]
impl ResourceBuilder for RdsBuilder {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Route
    }

    fn init(&mut self, client: Arc<XdsClient>, registry: Arc<dyn ServiceRegistry>) {
        self.binding.bind(client, registry);
    }

    async fn generate(&self, _option: &BuildOption) -> Result<Vec<BuiltResource>> {
        let (client, registry) = self.binding.get(ResourceKind::Route)?;
        let services = registry.visible_services(&client.visibility()).await?;

        let mut resources = Vec::new();
        for direction in policy::directions_for(client.run_type) {
            let name = policy::route_config_name(client, *direction)?;
            let virtual_hosts = match (client.run_type, direction) {
                (RunType::Gateway, _) => self.gateway(registry, &services).await?,
                (RunType::Sidecar, TrafficDirection::Inbound) => {
                    Self::sidecar_inbound(client.self_service()?)
                }
                (RunType::Sidecar, TrafficDirection::Outbound) => {
                    self.sidecar_outbound(registry, &client.namespace, &services).await?
                }
            };
            let config =
                RouteConfiguration { name: name.clone(), virtual_hosts, ..Default::default() };
            resources.push(BuiltResource::new(name, ResourceKind::Route, &config));
        }

        debug!(node_id = %client.node_id, routes = resources.len(), "Built route resources");
        Ok(resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ServiceKey;
    use crate::registry::InMemoryRegistry;
    use crate::xds::builders::test_support::{self, orders, payments};

    async fn route_configs(
        client: Arc<XdsClient>,
        registry: Arc<InMemoryRegistry>,
    ) -> Vec<RouteConfiguration> {
        let mut builder = RdsBuilder::new();
        builder.init(client, registry);
        builder
            .generate(&BuildOption::default())
            .await
            .expect("routes build")
            .iter()
            .map(|built| built.decode::<RouteConfiguration>().expect("decode route"))
            .collect()
    }

    fn cluster_of(route: &Route) -> &ClusterSpecifier {
        match route.action.as_ref() {
            Some(route::Action::Route(action)) => action.cluster_specifier.as_ref().unwrap(),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[tokio::test]
    async fn sidecar_gets_inbound_and_outbound_configs() {
        let configs = route_configs(test_support::sidecar(), test_support::registry()).await;
        let names: Vec<_> = configs.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["INBOUND|default|orders", "OUTBOUND|default|orders"]);

        let inbound = &configs[0];
        assert_eq!(
            cluster_of(&inbound.virtual_hosts[0].routes[0]),
            &ClusterSpecifier::Cluster(PASSTHROUGH_CLUSTER.to_string())
        );

        let outbound = &configs[1];
        assert_eq!(outbound.virtual_hosts.len(), 2);
        let payments_host =
            outbound.virtual_hosts.iter().find(|vh| vh.name == "default|payments").unwrap();
        assert_eq!(payments_host.domains, vec!["payments", "payments.default"]);
        let route_names: Vec<_> = payments_host.routes.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(route_names, vec!["payments-api", "default"]);
    }

    #[tokio::test]
    async fn same_name_in_other_namespace_gets_qualified_domain_only() {
        let registry = test_support::registry();
        registry.upsert_service(Service::new(ServiceKey::new("shop", "orders")));

        let configs = route_configs(test_support::sidecar(), registry).await;
        let outbound = &configs[1];
        let domains: Vec<&str> = outbound
            .virtual_hosts
            .iter()
            .flat_map(|vh| vh.domains.iter().map(String::as_str))
            .collect();
        let unique: HashSet<&str> = domains.iter().copied().collect();
        assert_eq!(domains.len(), unique.len());

        let shop = outbound.virtual_hosts.iter().find(|vh| vh.name == "shop|orders").unwrap();
        assert_eq!(shop.domains, vec!["orders.shop"]);
        let local = outbound.virtual_hosts.iter().find(|vh| vh.name == "default|orders").unwrap();
        assert_eq!(local.domains, vec!["orders", "orders.default"]);
    }

    #[tokio::test]
    async fn gateway_gets_single_config_of_exposed_rules() {
        let configs = route_configs(test_support::gateway(), test_support::registry()).await;
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "OUTBOUND|gateway");

        let host = &configs[0].virtual_hosts[0];
        assert_eq!(host.domains, vec!["*"]);
        assert_eq!(host.routes.len(), 1);
        let matcher = host.routes[0].r#match.as_ref().unwrap();
        assert_eq!(matcher.path_specifier, Some(PathSpecifier::Prefix("/pay".into())));
    }

    #[tokio::test]
    async fn weighted_rules_split_and_drop_invisible_destinations() {
        let registry = test_support::registry();
        registry.set_routing_rules(
            &orders(),
            vec![
                RoutingRule::new("canary")
                    .with_header("x-canary", StringMatch::Exact("true".into()))
                    .with_destination(orders(), 80)
                    .with_destination(payments(), 20)
                    .with_destination(ServiceKey::new("hidden", "ghost"), 50),
                RoutingRule::new("ghost-only")
                    .with_destination(ServiceKey::new("hidden", "ghost"), 100),
            ],
        );

        let configs = route_configs(test_support::sidecar(), registry).await;
        let orders_host =
            configs[1].virtual_hosts.iter().find(|vh| vh.name == "default|orders").unwrap();
        let route_names: Vec<_> = orders_host.routes.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(route_names, vec!["canary", "default"]);

        match cluster_of(&orders_host.routes[0]) {
            ClusterSpecifier::WeightedClusters(weighted) => {
                let split: Vec<_> = weighted
                    .clusters
                    .iter()
                    .map(|c| (c.name.as_str(), c.weight.as_ref().map(|w| w.value)))
                    .collect();
                assert_eq!(
                    split,
                    vec![("default|orders", Some(80)), ("default|payments", Some(20))]
                );
            }
            other => panic!("expected weighted clusters, got {:?}", other),
        }

        let headers = &orders_host.routes[0].r#match.as_ref().unwrap().headers;
        assert_eq!(headers[0].name, "x-canary");
    }

    #[tokio::test]
    async fn sidecar_without_identity_fails() {
        let client = Arc::new(XdsClient {
            self_service: None,
            ..XdsClient::sidecar("default/anon", orders())
        });
        let mut builder = RdsBuilder::new();
        builder.init(client, test_support::registry());
        assert!(builder.generate(&BuildOption::default()).await.unwrap_err().is_config());
    }
}
