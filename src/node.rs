//! A single addressable endpoint plus its lifecycle state (spec §4.8).

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Candidate = 0,
    Connecting = 1,
    Connected = 2,
    Weak = 3,
    Dead = 4,
    Closing = 5,
}

impl NodeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => NodeState::Candidate,
            1 => NodeState::Connecting,
            2 => NodeState::Connected,
            3 => NodeState::Weak,
            4 => NodeState::Dead,
            _ => NodeState::Closing,
        }
    }
}

/// One cluster member. `Node`s are cheap to clone (an `Arc`-free value
/// type) so `Cluster` can hand out whole snapshots without shared
/// mutable state leaking between readers.
#[derive(Clone)]
pub struct Node {
    url: Url,
    state: std::sync::Arc<AtomicU8>,
    warm_up_deadline: Instant,
    registered_at: Instant,
}

impl Node {
    pub fn new(url: Url, warm_up: Duration) -> Self {
        let now = Instant::now();
        Self {
            url,
            state: std::sync::Arc::new(AtomicU8::new(NodeState::Candidate as u8)),
            warm_up_deadline: now + warm_up,
            registered_at: now,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn weight(&self) -> u32 {
        self.url.weight()
    }

    pub fn region(&self) -> String {
        self.url.param_or("region", "")
    }

    pub fn datacenter(&self) -> String {
        self.url.param_or("datacenter", "")
    }

    pub fn past_warm_up(&self) -> bool {
        Instant::now() >= self.warm_up_deadline
    }

    /// Admission policy (spec §4.9): eligible for traffic iff `Connected`
    /// and past the warm-up deadline.
    pub fn admissible(&self) -> bool {
        self.state() == NodeState::Connected && self.past_warm_up()
    }

    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("url", &self.url).field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshly_connected_node_is_not_admissible_during_warm_up() {
        let node = Node::new(Url::new("tcp", "h", 1, "Echo"), Duration::from_secs(60));
        node.set_state(NodeState::Connected);
        assert!(!node.admissible());
    }

    #[test]
    fn node_with_zero_warm_up_is_admissible_once_connected() {
        let node = Node::new(Url::new("tcp", "h", 1, "Echo"), Duration::from_millis(0));
        assert!(!node.admissible());
        node.set_state(NodeState::Connected);
        assert!(node.admissible());
    }
}
