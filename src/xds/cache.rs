use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::debug;

use super::builders::{BuiltResource, ResourceKind};
use super::snapshot::Snapshot;

/// Changes to one resource kind between two snapshots of the same client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceDelta {
    pub type_url: String,
    pub added_or_updated: Vec<BuiltResource>,
    pub removed: Vec<String>,
}

impl ResourceDelta {
    pub fn is_empty(&self) -> bool {
        self.added_or_updated.is_empty() && self.removed.is_empty()
    }
}

/// Broadcast payload handed to the delivery transport: the full snapshot for
/// one client, its version, and what changed since the previous version.
#[derive(Clone, Debug)]
pub struct SnapshotUpdate {
    pub node_id: String,
    pub version: u64,
    pub snapshot: Arc<Snapshot>,
    pub deltas: Vec<ResourceDelta>,
}

#[derive(Debug, Default)]
struct NodeEntry {
    version: u64,
    snapshot: Option<Arc<Snapshot>>,
}

/// Last published snapshot per client. Versions are per client and never go
/// backwards, including across [`SnapshotCache::clear`].
#[derive(Debug)]
pub struct SnapshotCache {
    entries: RwLock<HashMap<String, NodeEntry>>,
    update_tx: broadcast::Sender<Arc<SnapshotUpdate>>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        let (update_tx, _) = broadcast::channel(128);
        Self { entries: RwLock::new(HashMap::new()), update_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SnapshotUpdate>> {
        self.update_tx.subscribe()
    }

    /// Store `snapshot` for `node_id` and broadcast the change.
    /// Returns `None` when it is identical to the stored one.
    pub fn apply(&self, node_id: &str, snapshot: Snapshot) -> Option<Arc<SnapshotUpdate>> {
        let mut entries = self.entries.write().expect("snapshot cache lock poisoned");
        let entry = entries.entry(node_id.to_string()).or_default();

        let deltas = diff(entry.snapshot.as_deref(), &snapshot);
        if entry.snapshot.is_some() && deltas.iter().all(ResourceDelta::is_empty) {
            return None;
        }

        entry.version += 1;
        let snapshot = Arc::new(snapshot);
        entry.snapshot = Some(snapshot.clone());

        let update = Arc::new(SnapshotUpdate {
            node_id: node_id.to_string(),
            version: entry.version,
            snapshot,
            deltas,
        });
        debug!(node_id, version = update.version, "Snapshot updated");

        let _ = self.update_tx.send(update.clone());
        Some(update)
    }

    pub fn snapshot(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        let entries = self.entries.read().expect("snapshot cache lock poisoned");
        entries.get(node_id).and_then(|entry| entry.snapshot.clone())
    }

    pub fn version(&self, node_id: &str) -> u64 {
        let entries = self.entries.read().expect("snapshot cache lock poisoned");
        entries.get(node_id).map(|entry| entry.version).unwrap_or(0)
    }

    /// Forget the snapshot of a disconnected client, keeping its version.
    pub fn clear(&self, node_id: &str) {
        let mut entries = self.entries.write().expect("snapshot cache lock poisoned");
        if let Some(entry) = entries.get_mut(node_id) {
            entry.snapshot = None;
        }
    }
}

fn diff(previous: Option<&Snapshot>, next: &Snapshot) -> Vec<ResourceDelta> {
    ResourceKind::ALL
        .into_iter()
        .filter_map(|kind| {
            let before: HashMap<&str, &BuiltResource> = previous
                .map(|snapshot| snapshot.resources(kind))
                .unwrap_or_default()
                .iter()
                .map(|resource| (resource.name.as_str(), resource))
                .collect();
            let after = next.resources(kind);
            let incoming: HashSet<&str> = after.iter().map(|r| r.name.as_str()).collect();

            let mut removed: Vec<String> = before
                .keys()
                .filter(|name| !incoming.contains(*name))
                .map(|name| name.to_string())
                .collect();
            removed.sort();

            let added_or_updated: Vec<BuiltResource> = after
                .iter()
                .filter(|resource| match before.get(resource.name.as_str()) {
                    Some(existing) => existing.resource != resource.resource,
                    None => true,
                })
                .cloned()
                .collect();

            if previous.is_some() && added_or_updated.is_empty() && removed.is_empty() {
                return None;
            }
            Some(ResourceDelta { type_url: kind.type_url().to_string(), added_or_updated, removed })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::google::protobuf::Any;

    fn fake_resource(name: &str, payload: &[u8]) -> BuiltResource {
        BuiltResource {
            name: name.to_string(),
            resource: Any {
                type_url: ResourceKind::Cluster.type_url().to_string(),
                value: payload.to_vec(),
            },
        }
    }

    fn clusters(resources: Vec<BuiltResource>) -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.insert(ResourceKind::Cluster, resources);
        snapshot
    }

    #[tokio::test]
    async fn apply_tracks_add_update_and_remove() {
        let cache = SnapshotCache::new();
        let mut receiver = cache.subscribe();

        cache
            .apply("node-1", clusters(vec![fake_resource("cluster-1", b"payload-1")]))
            .expect("update expected");
        let update = receiver.recv().await.expect("first update");
        assert_eq!(update.version, 1);
        let delta = update.deltas.iter().find(|d| !d.is_empty()).unwrap();
        assert_eq!(delta.type_url, ResourceKind::Cluster.type_url());
        assert_eq!(delta.added_or_updated.len(), 1);

        // Identical snapshot is not republished
        assert!(cache
            .apply("node-1", clusters(vec![fake_resource("cluster-1", b"payload-1")]))
            .is_none());

        cache
            .apply("node-1", clusters(vec![fake_resource("cluster-1", b"payload-2")]))
            .expect("update expected");
        let update = receiver.recv().await.expect("second update");
        assert_eq!(update.version, 2);
        assert_eq!(update.deltas.len(), 1);
        assert_eq!(update.deltas[0].added_or_updated[0].name, "cluster-1");

        cache.apply("node-1", clusters(Vec::new())).expect("removal delta expected");
        let update = receiver.recv().await.expect("third update");
        assert_eq!(update.deltas[0].removed, vec!["cluster-1".to_string()]);
        assert_eq!(update.version, 3);
    }

    #[tokio::test]
    async fn versions_are_per_node_and_survive_clear() {
        let cache = SnapshotCache::new();
        cache.apply("a", clusters(vec![fake_resource("c", b"1")]));
        cache.apply("a", clusters(vec![fake_resource("c", b"2")]));
        cache.apply("b", clusters(vec![fake_resource("c", b"1")]));
        assert_eq!(cache.version("a"), 2);
        assert_eq!(cache.version("b"), 1);

        cache.clear("a");
        assert!(cache.snapshot("a").is_none());
        let update = cache.apply("a", clusters(vec![fake_resource("c", b"2")])).unwrap();
        assert_eq!(update.version, 3);
    }

    #[tokio::test]
    async fn broadcast_updates_to_multiple_subscribers() {
        let cache = SnapshotCache::new();
        let mut rx1 = cache.subscribe();
        let mut rx2 = cache.subscribe();

        cache.apply("node-1", clusters(vec![fake_resource("cluster-1", b"payload")]));

        let update1 = rx1.recv().await.expect("subscriber one update");
        let update2 = rx2.recv().await.expect("subscriber two update");
        assert_eq!(update1.version, update2.version);
        assert_eq!(update1.node_id, "node-1");
        assert!(Arc::ptr_eq(&update1.snapshot, &update2.snapshot));
    }
}
