//! Registry Client (spec §4.7): subscribe to a cluster's node set and to
//! dynamic configuration, both versioned so a resubscribe after a
//! disconnect can detect whether it missed anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::error::Result;
use crate::node::Node;
use crate::url::Url;

/// A cluster snapshot plus the version it was taken at. Versions are
/// monotonically increasing per registry instance; a subscriber can always
/// tell a stale notification from a fresh one by comparing versions rather
/// than diffing node sets (spec §4.7 "monotonic version ordering").
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub version: u64,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub values: HashMap<String, String>,
}

/// Registry plugin contract (spec §4.7). One registration is scoped to a
/// single `(interface, alias)`; a Cluster holds one subscription per
/// configured registry.
#[async_trait]
pub trait Registry: Send + Sync {
    fn name(&self) -> &str;

    async fn register(&self, node: &Node) -> Result<()>;
    async fn deregister(&self, url: &Url) -> Result<()>;

    /// Subscribe to cluster membership changes for `interface`. The
    /// returned receiver replays the current snapshot immediately, then
    /// streams every subsequent version (spec §4.7 "durable resubscribe
    /// with snapshot replay").
    async fn subscribe_cluster(&self, interface: &str) -> Result<mpsc::Receiver<ClusterSnapshot>>;

    async fn subscribe_configure(&self, interface: &str) -> Result<mpsc::Receiver<ConfigSnapshot>>;
}

struct InterfaceState {
    nodes: Vec<Node>,
    version: u64,
    cluster_subs: Vec<mpsc::Sender<ClusterSnapshot>>,
    config: HashMap<String, String>,
    config_version: u64,
    config_subs: Vec<mpsc::Sender<ConfigSnapshot>>,
}

impl InterfaceState {
    fn empty() -> Self {
        Self { nodes: Vec::new(), version: 0, cluster_subs: Vec::new(), config: HashMap::new(), config_version: 0, config_subs: Vec::new() }
    }
}

/// Reference in-process registry: one mutable node set per interface,
/// mutated only through `register`/`deregister`/`set_config`, and fanned
/// out to every live subscriber on change. Suitable for tests and for a
/// single-process deployment with no external coordination service.
pub struct InMemoryRegistry {
    name: String,
    state: RwLock<HashMap<String, InterfaceState>>,
}

impl InMemoryRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), state: RwLock::new(HashMap::new()) }
    }

    pub async fn set_config(&self, interface: &str, key: impl Into<String>, value: impl Into<String>) {
        let mut guard = self.state.write().await;
        let entry = guard.entry(interface.to_string()).or_insert_with(InterfaceState::empty);
        entry.config.insert(key.into(), value.into());
        entry.config_version += 1;
        let snapshot = ConfigSnapshot { version: entry.config_version, values: entry.config.clone() };
        entry.config_subs.retain(|tx| tx.try_send(snapshot.clone()).is_ok() || !tx.is_closed());
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    async fn register(&self, node: &Node) -> Result<()> {
        let mut guard = self.state.write().await;
        let entry = guard.entry(node.url().interface().to_string()).or_insert_with(InterfaceState::empty);
        entry.nodes.retain(|n| n.url() != node.url());
        entry.nodes.push(node.clone());
        entry.version += 1;
        let snapshot = ClusterSnapshot { version: entry.version, nodes: entry.nodes.clone() };
        entry.cluster_subs.retain(|tx| tx.try_send(snapshot.clone()).is_ok() || !tx.is_closed());
        Ok(())
    }

    async fn deregister(&self, url: &Url) -> Result<()> {
        let mut guard = self.state.write().await;
        if let Some(entry) = guard.get_mut(url.interface()) {
            entry.nodes.retain(|n| n.url() != url);
            entry.version += 1;
            let snapshot = ClusterSnapshot { version: entry.version, nodes: entry.nodes.clone() };
            entry.cluster_subs.retain(|tx| tx.try_send(snapshot.clone()).is_ok() || !tx.is_closed());
        }
        Ok(())
    }

    async fn subscribe_cluster(&self, interface: &str) -> Result<mpsc::Receiver<ClusterSnapshot>> {
        let (tx, rx) = mpsc::channel(32);
        let mut guard = self.state.write().await;
        let entry = guard.entry(interface.to_string()).or_insert_with(InterfaceState::empty);
        let _ = tx.send(ClusterSnapshot { version: entry.version, nodes: entry.nodes.clone() }).await;
        entry.cluster_subs.push(tx);
        Ok(rx)
    }

    async fn subscribe_configure(&self, interface: &str) -> Result<mpsc::Receiver<ConfigSnapshot>> {
        let (tx, rx) = mpsc::channel(32);
        let mut guard = self.state.write().await;
        let entry = guard.entry(interface.to_string()).or_insert_with(InterfaceState::empty);
        let _ = tx.send(ConfigSnapshot { version: entry.config_version, values: entry.config.clone() }).await;
        entry.config_subs.push(tx);
        Ok(rx)
    }
}

/// Reference static registry: a fixed node list supplied at construction,
/// for deployments that configure peers out-of-band (spec §4.7's allowance
/// for a registry-less static topology).
pub struct StaticRegistry {
    name: String,
    version: AtomicU64,
    nodes: Arc<RwLock<HashMap<String, Vec<Node>>>>,
}

impl StaticRegistry {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        let mut by_interface: HashMap<String, Vec<Node>> = HashMap::new();
        for node in nodes {
            by_interface.entry(node.url().interface().to_string()).or_default().push(node);
        }
        Self { name: name.into(), version: AtomicU64::new(1), nodes: Arc::new(RwLock::new(by_interface)) }
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    async fn register(&self, _node: &Node) -> Result<()> {
        Ok(()) // static topology; registration is a documented no-op
    }

    async fn deregister(&self, _url: &Url) -> Result<()> {
        Ok(())
    }

    async fn subscribe_cluster(&self, interface: &str) -> Result<mpsc::Receiver<ClusterSnapshot>> {
        let (tx, rx) = mpsc::channel(1);
        let nodes = self.nodes.read().await.get(interface).cloned().unwrap_or_default();
        let _ = tx.send(ClusterSnapshot { version: self.version.load(Ordering::Relaxed), nodes }).await;
        Ok(rx)
    }

    async fn subscribe_configure(&self, _interface: &str) -> Result<mpsc::Receiver<ConfigSnapshot>> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(ConfigSnapshot { version: 1, values: HashMap::new() }).await;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn subscribe_replays_current_snapshot_then_streams_updates() {
        let registry = InMemoryRegistry::new("mem");
        let node = Node::new(Url::new("tcp", "h", 1, "Echo"), Duration::from_millis(0));
        registry.register(&node).await.unwrap();

        let mut rx = registry.subscribe_cluster("Echo").await.unwrap();
        let replay = rx.recv().await.unwrap();
        assert_eq!(replay.version, 1);
        assert_eq!(replay.nodes.len(), 1);

        let node2 = Node::new(Url::new("tcp", "h2", 2, "Echo"), Duration::from_millis(0));
        registry.register(&node2).await.unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(update.version, 2);
        assert_eq!(update.nodes.len(), 2);
    }

    #[tokio::test]
    async fn versions_strictly_increase_across_register_and_deregister() {
        let registry = InMemoryRegistry::new("mem");
        let node = Node::new(Url::new("tcp", "h", 1, "Echo"), Duration::from_millis(0));
        registry.register(&node).await.unwrap();
        registry.deregister(node.url()).await.unwrap();

        let mut rx = registry.subscribe_cluster("Echo").await.unwrap();
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.version, 2);
        assert!(snapshot.nodes.is_empty());
    }

    #[tokio::test]
    async fn static_registry_subscribe_returns_fixed_set() {
        let node = Node::new(Url::new("tcp", "h", 1, "Echo"), Duration::from_millis(0));
        let registry = StaticRegistry::new("static", vec![node]);
        let mut rx = registry.subscribe_cluster("Echo").await.unwrap();
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.nodes.len(), 1);
    }
}
