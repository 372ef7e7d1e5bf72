//! # Domain Model
//!
//! Registry-side types the xDS builders consume: services, their instances,
//! traffic-routing rules, and TLS policy.

mod routing;
mod service;

pub use routing::{HeaderMatch, PathMatch, RoutingRule, StringMatch, WeightedDestination};
pub use service::{Locality, Service, ServiceInstance, ServiceKey, TlsMode};
