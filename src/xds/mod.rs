//! Envoy xDS resource synthesis
//!
//! Turns a connected proxy's identity plus registry state into the four
//! discovery resource kinds:
//! - LDS (listeners, one per traffic direction)
//! - CDS (clusters)
//! - RDS (route configurations)
//! - EDS (cluster load assignments)
//!
//! [`XdsGenerator`] assembles them into per-client [`Snapshot`]s and publishes
//! them through the [`SnapshotCache`] for a delivery transport to push.

pub mod builders;
pub mod cache;
pub mod context;
pub mod dispatch;
pub mod policy;
pub mod snapshot;

pub use builders::{
    builder_for, builders_for_client, BuiltResource, ResourceBuilder, ResourceKind,
};
pub use cache::{ResourceDelta, SnapshotCache, SnapshotUpdate};
pub use context::{BuildOption, RunType, TrafficDirection, XdsClient};
pub use dispatch::{ClientSession, PushSummary, XdsGenerator};
pub use policy::BindPortPolicy;
pub use snapshot::Snapshot;
