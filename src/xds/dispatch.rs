//! Snapshot assembly and regeneration triggers.
//!
//! [`XdsGenerator`] owns the table of connected clients. For each client it
//! runs every resource builder with the client's current [`BuildOption`],
//! assembles the results into one [`Snapshot`] and hands it to the
//! [`SnapshotCache`]. A failure in any builder fails the whole snapshot; the
//! client keeps whatever was published last.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use envoy_types::pb::envoy::config::core::v3::Node;
use futures::future::{join_all, try_join_all};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn, Instrument};

use super::builders::{builders_for_client, ResourceBuilder, ResourceKind};
use super::cache::{SnapshotCache, SnapshotUpdate};
use super::context::{BuildOption, XdsClient};
use super::snapshot::Snapshot;
use crate::config::XdsConfig;
use crate::domain::{ServiceKey, TlsMode};
use crate::registry::{RegistryEvent, ServiceRegistry};
use crate::{xds_span, Error, Result};

/// A registered client and its bound builders.
#[derive(Debug)]
pub struct ClientSession {
    client: Arc<XdsClient>,
    builders: BTreeMap<ResourceKind, Box<dyn ResourceBuilder>>,
    tls_override: RwLock<Option<TlsMode>>,
    push_lock: Mutex<()>,
    connected: AtomicBool,
}

impl ClientSession {
    pub fn client(&self) -> &XdsClient {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn tls_override(&self) -> Option<TlsMode> {
        *self.tls_override.read().expect("tls override lock poisoned")
    }

    fn set_tls_override(&self, mode: Option<TlsMode>) {
        *self.tls_override.write().expect("tls override lock poisoned") = mode;
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

/// Outcome of regenerating a set of clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<String>,
}

impl PushSummary {
    pub fn total(&self) -> usize {
        self.updated.len() + self.unchanged.len() + self.failed.len()
    }
}

#[derive(Debug)]
pub struct XdsGenerator {
    config: XdsConfig,
    registry: Arc<dyn ServiceRegistry>,
    cache: SnapshotCache,
    sessions: DashMap<String, Arc<ClientSession>>,
}

impl XdsGenerator {
    pub fn new(config: XdsConfig, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self { config, registry, cache: SnapshotCache::new(), sessions: DashMap::new() }
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Stream of published snapshots for the delivery transport.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SnapshotUpdate>> {
        self.cache.subscribe()
    }

    /// Register `client`, replacing any earlier session with the same node id.
    pub fn register(&self, client: XdsClient) -> Arc<ClientSession> {
        let client = Arc::new(client);
        let session = Arc::new(ClientSession {
            builders: builders_for_client(&self.config, client.clone(), self.registry.clone()),
            client: client.clone(),
            tls_override: RwLock::new(None),
            push_lock: Mutex::new(()),
            connected: AtomicBool::new(true),
        });

        if let Some(previous) = self.sessions.insert(client.node_id.clone(), session.clone()) {
            previous.disconnect();
            debug!(node_id = %client.node_id, "Replaced existing client session");
        }
        info!(
            node_id = %client.node_id,
            run_type = ?client.run_type,
            namespace = %client.namespace,
            "Client registered"
        );
        session
    }

    pub fn register_node(&self, node: &Node) -> Result<Arc<ClientSession>> {
        Ok(self.register(XdsClient::from_node(node)?))
    }

    /// Drop a client. A push still in flight for it completes but is discarded.
    pub async fn unregister(&self, node_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(node_id) else {
            return false;
        };
        session.disconnect();
        // A push that saw the client connected publishes before the cache is cleared.
        let _guard = session.push_lock.lock().await;
        self.cache.clear(node_id);
        info!(node_id, "Client unregistered");
        true
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn session(&self, node_id: &str) -> Result<Arc<ClientSession>> {
        self.sessions
            .get(node_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::config(format!("Unknown client '{}'", node_id)))
    }

    /// TLS mode for the next push: the override, then what the node asked
    /// for, then the TLS policy a sidecar's own service has in the registry
    /// (when not `none`), then the configured default.
    pub async fn build_option(&self, session: &ClientSession) -> Result<BuildOption> {
        if let Some(mode) = session.tls_override().or(session.client.requested_tls_mode) {
            return Ok(BuildOption::new(mode));
        }

        let service_mode = match &session.client.self_service {
            Some(key) if !key.is_empty() => {
                self.registry
                    .service(key)
                    .await?
                    .map(|service| service.tls_mode)
                    .filter(TlsMode::is_enabled)
            }
            _ => None,
        };
        Ok(BuildOption::new(service_mode.unwrap_or(self.config.default_tls_mode)))
    }

    /// Run every builder for `session` and assemble the results.
    pub async fn generate_snapshot(&self, session: &ClientSession) -> Result<Snapshot> {
        let option = self.build_option(session).await?;
        debug!(tls_mode = %option.tls_mode.as_str(), "Resolved build option");
        let results = try_join_all(session.builders.iter().map(|(kind, builder)| {
            let option = &option;
            async move { builder.generate(option).await.map(|resources| (*kind, resources)) }
        }))
        .await?;

        let mut snapshot = Snapshot::new();
        for (kind, resources) in results {
            snapshot.insert(kind, resources);
        }
        snapshot.check_consistency()?;
        Ok(snapshot)
    }

    /// Regenerate and publish the snapshot of one client.
    ///
    /// Pushes for the same client run one at a time in the order they were
    /// requested. Returns `Ok(None)` when nothing changed or the client went
    /// away while its snapshot was being built.
    pub async fn push(&self, node_id: &str) -> Result<Option<Arc<SnapshotUpdate>>> {
        let session = self.session(node_id)?;
        let _guard = session.push_lock.lock().await;

        let span = xds_span!("generate_snapshot", node_id);
        let snapshot = match self.generate_snapshot(&session).instrument(span).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(node_id, error = %e, "Snapshot generation failed; keeping last snapshot");
                return Err(e);
            }
        };

        if !session.is_connected() {
            debug!(node_id, "Client disconnected during generation; discarding snapshot");
            return Ok(None);
        }

        let update = self.cache.apply(node_id, snapshot);
        match &update {
            Some(update) => info!(
                node_id,
                version = update.version,
                resources = update.snapshot.len(),
                "Published snapshot"
            ),
            None => debug!(node_id, "Snapshot unchanged"),
        }
        Ok(update)
    }

    /// Change a client's TLS mode without reconnecting and regenerate it.
    /// `None` clears the override.
    pub async fn set_tls_mode(
        &self,
        node_id: &str,
        mode: Option<TlsMode>,
    ) -> Result<Option<Arc<SnapshotUpdate>>> {
        self.session(node_id)?.set_tls_override(mode);
        info!(node_id, tls_mode = ?mode, "TLS mode override changed");
        self.push(node_id).await
    }

    /// Regenerate every registered client. Clients are pushed concurrently and
    /// a failure for one does not affect the others.
    pub async fn on_registry_change(&self, changed: &[ServiceKey]) -> PushSummary {
        let node_ids = self.client_ids();
        debug!(services = ?changed, clients = node_ids.len(), "Registry changed");

        let results = join_all(node_ids.iter().map(|node_id| self.push(node_id))).await;

        let mut summary = PushSummary::default();
        for (node_id, result) in node_ids.into_iter().zip(results) {
            match result {
                Ok(Some(_)) => summary.updated.push(node_id),
                Ok(None) => summary.unchanged.push(node_id),
                Err(_) => summary.failed.push(node_id),
            }
        }
        if !summary.failed.is_empty() {
            warn!(failed = ?summary.failed, "Some clients kept their previous snapshot");
        }
        summary
    }

    /// Consume registry events until the channel closes.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<RegistryEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    debug!(revision = event.revision, "Registry event received");
                    self.on_registry_change(&event.services).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Registry events lagged; regenerating all clients");
                    self.on_registry_change(&[]).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Registry event stream closed");
                    break;
                }
            }
        }
    }
}
