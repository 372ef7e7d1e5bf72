//! Resource builders, one per xDS resource kind.
//!
//! Every builder follows the same contract: [`ResourceBuilder::init`] binds it
//! to one client and to the registry, and [`ResourceBuilder::generate`]
//! produces the complete resource list for that client or fails without a
//! partial result. Builders hold nothing but those bindings and their
//! immutable configuration, so one builder may serve concurrent pushes.

mod cds;
mod eds;
mod lds;
mod rds;

pub use cds::CdsBuilder;
pub use eds::EdsBuilder;
pub use lds::{bound_http_connection_manager, LdsBuilder};
pub use rds::RdsBuilder;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;

use crate::config::XdsConfig;
use crate::registry::ServiceRegistry;
use crate::xds::context::{BuildOption, XdsClient};
use crate::{Error, Result};

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Cluster,
    Endpoint,
    Listener,
    Route,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cluster,
        ResourceKind::Endpoint,
        ResourceKind::Listener,
        ResourceKind::Route,
    ];

    pub fn type_url(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => CLUSTER_TYPE_URL,
            ResourceKind::Endpoint => ENDPOINT_TYPE_URL,
            ResourceKind::Listener => LISTENER_TYPE_URL,
            ResourceKind::Route => ROUTE_TYPE_URL,
        }
    }

    pub fn from_type_url(type_url: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_url() == type_url)
    }

    /// Discovery service acronym, e.g. `LDS`.
    pub fn service_name(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => "CDS",
            ResourceKind::Endpoint => "EDS",
            ResourceKind::Listener => "LDS",
            ResourceKind::Route => "RDS",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_name())
    }
}

/// Wrapper for a built Envoy resource along with its name.
#[derive(Clone, Debug, PartialEq)]
pub struct BuiltResource {
    pub name: String,
    pub resource: Any,
}

impl BuiltResource {
    pub fn new<M: Message>(name: impl Into<String>, kind: ResourceKind, message: &M) -> Self {
        Self {
            name: name.into(),
            resource: Any { type_url: kind.type_url().to_string(), value: message.encode_to_vec() },
        }
    }

    pub fn into_any(self) -> Any {
        self.resource
    }

    pub fn type_url(&self) -> &str {
        &self.resource.type_url
    }

    pub fn decode<M: Message + Default>(&self) -> Result<M> {
        Ok(M::decode(&*self.resource.value)?)
    }
}

#[async_trait]
pub trait ResourceBuilder: Send + Sync + fmt::Debug {
    fn kind(&self) -> ResourceKind;

    /// Bind the builder to a client and the registry. Calling it again rebinds.
    fn init(&mut self, client: Arc<XdsClient>, registry: Arc<dyn ServiceRegistry>);

    async fn generate(&self, option: &BuildOption) -> Result<Vec<BuiltResource>>;
}

/// Client and registry a builder was initialised with.
#[derive(Debug, Clone, Default)]
pub(crate) struct Binding {
    inner: Option<(Arc<XdsClient>, Arc<dyn ServiceRegistry>)>,
}

impl Binding {
    pub(crate) fn bind(&mut self, client: Arc<XdsClient>, registry: Arc<dyn ServiceRegistry>) {
        self.inner = Some((client, registry));
    }

    pub(crate) fn get(&self, kind: ResourceKind) -> Result<(&XdsClient, &dyn ServiceRegistry)> {
        self.inner
            .as_ref()
            .map(|(client, registry)| (client.as_ref(), registry.as_ref()))
            .ok_or_else(|| Error::internal(format!("{} builder used before init", kind)))
    }
}

/// Fresh, unbound builder for `kind`.
pub fn builder_for(kind: ResourceKind, config: &XdsConfig) -> Box<dyn ResourceBuilder> {
    match kind {
        ResourceKind::Cluster => Box::new(CdsBuilder::new(config)),
        ResourceKind::Endpoint => Box::new(EdsBuilder::new()),
        ResourceKind::Listener => Box::new(LdsBuilder::new(config)),
        ResourceKind::Route => Box::new(RdsBuilder::new()),
    }
}

/// One initialised builder per resource kind for `client`.
pub fn builders_for_client(
    config: &XdsConfig,
    client: Arc<XdsClient>,
    registry: Arc<dyn ServiceRegistry>,
) -> BTreeMap<ResourceKind, Box<dyn ResourceBuilder>> {
    ResourceKind::ALL
        .into_iter()
        .map(|kind| {
            let mut builder = builder_for(kind, config);
            builder.init(client.clone(), registry.clone());
            (kind, builder)
        })
        .collect()
}
