//! # Flowmesh
//!
//! Resource-synthesis core of a service-mesh control plane. For every
//! connected Envoy proxy, sidecar or edge gateway, it builds listeners,
//! clusters, routes and endpoints from the service registry and publishes
//! them as one versioned snapshot per proxy.
//!
//! ## Architecture
//!
//! ```text
//! ServiceRegistry ──► LDS / CDS / RDS / EDS builders ──► XdsGenerator ──► SnapshotCache
//!        │                                                    ▲               │
//!        └──────────────────── RegistryEvent ─────────────────┘               ▼
//!                                                                    delivery transport
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowmesh::{Config, InMemoryRegistry, Result, ServiceKey, XdsClient, XdsGenerator};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::from_env()?;
//!     let registry = Arc::new(InMemoryRegistry::from_yaml_file("registry.yaml")?);
//!     let generator = XdsGenerator::new(config.xds, registry);
//!     let orders = ServiceKey::new("default", "orders");
//!     let client = XdsClient::sidecar("default/sidecar-1~10.0.0.1", orders);
//!     let node_id = client.node_id.clone();
//!     generator.register(client);
//!     generator.push(&node_id).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod domain;
pub mod errors;
pub mod observability;
pub mod registry;
pub mod xds;

// Re-export commonly used types and traits
pub use config::Config;
pub use domain::{Service, ServiceInstance, ServiceKey, TlsMode};
pub use errors::{Error, Result};
pub use observability::init_tracing;
pub use registry::{InMemoryRegistry, ServiceRegistry};
pub use xds::{BuildOption, Snapshot, XdsClient, XdsGenerator};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
