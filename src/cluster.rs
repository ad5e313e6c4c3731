//! Cluster (spec §4.8, §4.9): the live, admission-filtered view of one
//! interface's nodes, kept in sync with a [`Registry`] subscription.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::node::{Node, NodeState};
use crate::registry::{ClusterSnapshot, Registry};
use crate::url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Added,
    Removed,
    Updated,
}

/// Immutable point-in-time view of cluster membership. Readers hand these
/// out by `Arc` clone, never by lock, so a long-held reference never blocks
/// a concurrent update (spec §4.8 "copy-on-write / atomic snapshot").
#[derive(Debug, Clone, Default)]
pub struct MembershipView {
    nodes: Vec<Node>,
}

impl MembershipView {
    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn all(&self) -> &[Node] {
        &self.nodes
    }

    /// Admissible nodes only (spec §4.9), in a deterministic order: by
    /// endpoint key, ties broken by full `Url` ordering so two processes
    /// observing the same membership always agree on order.
    pub fn admissible(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().filter(|n| n.admissible()).cloned().collect();
        nodes.sort_by(|a, b| a.url().cmp(b.url()));
        nodes
    }
}

/// Tracks one interface's membership, diffing each incoming
/// [`ClusterSnapshot`] against the previous one to report structural
/// changes without forcing every consumer to recompute a diff itself.
pub struct Cluster {
    interface: String,
    warm_up: Duration,
    current: RwLock<Arc<MembershipView>>,
    last_version: std::sync::atomic::AtomicU64,
}

impl Cluster {
    pub fn new(interface: impl Into<String>, warm_up: Duration) -> Self {
        Self {
            interface: interface.into(),
            warm_up,
            current: RwLock::new(Arc::new(MembershipView::default())),
            last_version: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn view(&self) -> Arc<MembershipView> {
        Arc::clone(&self.current.read())
    }

    /// Subscribe to `registry` and apply every snapshot as it arrives.
    /// Runs until the registry's channel closes (disconnect); the caller
    /// is expected to resubscribe, at which point the replayed snapshot
    /// naturally reconciles against whatever state survived the gap (spec
    /// §4.7's durable resubscribe).
    pub async fn run(&self, registry: Arc<dyn Registry>, mut on_change: impl FnMut(&Node, MembershipChange) + Send) {
        let mut rx = match registry.subscribe_cluster(&self.interface).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(error = %e, interface = %self.interface, "failed to subscribe to registry");
                return;
            }
        };

        while let Some(snapshot) = rx.recv().await {
            self.apply(snapshot, &mut on_change);
        }
    }

    /// Apply one snapshot: older-or-equal versions are dropped (spec §4.7
    /// monotonic ordering), newer ones are diffed against the current view.
    pub fn apply(&self, snapshot: ClusterSnapshot, on_change: &mut impl FnMut(&Node, MembershipChange)) {
        let last = self.last_version.load(std::sync::atomic::Ordering::Acquire);
        if snapshot.version <= last && last != 0 {
            tracing::debug!(interface = %self.interface, version = snapshot.version, last, "dropping stale snapshot");
            return;
        }

        let previous = Arc::clone(&self.current.read());
        let previous_by_key: HashMap<&Url, &Node> = previous.nodes.iter().map(|n| (n.url(), n)).collect();

        let mut next = Vec::with_capacity(snapshot.nodes.len());
        for incoming in &snapshot.nodes {
            match previous_by_key.get(incoming.url()) {
                Some(existing) => {
                    // Same endpoint already tracked: keep its live connection
                    // state machine, only fold in registry-sourced metadata.
                    next.push((*existing).clone());
                    on_change(incoming, MembershipChange::Updated);
                }
                None => {
                    let node = Node::new(incoming.url().clone(), self.warm_up);
                    on_change(&node, MembershipChange::Added);
                    next.push(node);
                }
            }
        }

        let next_keys: std::collections::HashSet<&Url> = snapshot.nodes.iter().map(|n| n.url()).collect();
        for gone in previous.nodes.iter().filter(|n| !next_keys.contains(n.url())) {
            gone.set_state(NodeState::Closing);
            on_change(gone, MembershipChange::Removed);
        }

        *self.current.write() = Arc::new(MembershipView { nodes: next });
        self.last_version.store(snapshot.version, std::sync::atomic::Ordering::Release);
    }
}
