//! LoadBalance (spec §4.9): picks one admissible [`Node`] per call.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{Result, RpcError};
use crate::node::Node;

#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub sticky_key: Option<String>,
    pub excluded: Vec<String>,
}

/// Strategy plugin contract (spec §4.9). Implementations only ever see
/// nodes that have already passed the admission policy.
#[async_trait]
pub trait LoadBalance: Send + Sync {
    fn name(&self) -> &str;
    async fn select(&self, candidates: &[Node], context: &SelectionContext) -> Result<Node>;
}

fn filter_excluded(candidates: &[Node], context: &SelectionContext) -> Vec<Node> {
    if context.excluded.is_empty() {
        return candidates.to_vec();
    }
    candidates.iter().filter(|n| !context.excluded.contains(&n.url().endpoint_key())).cloned().collect()
}

fn empty_pool(interface_hint: &str) -> RpcError {
    RpcError::NoAvailableNode { interface: interface_hint.to_string(), alias: "default".to_string() }
}

/// Rotates through candidates in the order given, wrapping around. The
/// counter is process-wide per `RoundRobinBalance` instance, not per call.
#[derive(Default)]
pub struct RoundRobinBalance {
    cursor: AtomicUsize,
}

#[async_trait]
impl LoadBalance for RoundRobinBalance {
    fn name(&self) -> &str {
        "round-robin"
    }

    async fn select(&self, candidates: &[Node], context: &SelectionContext) -> Result<Node> {
        let pool = filter_excluded(candidates, context);
        if pool.is_empty() {
            return Err(empty_pool(candidates.first().map(|n| n.url().interface()).unwrap_or("")));
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        Ok(pool[idx].clone())
    }
}

/// Weighted variant: each node's `Url` weight parameter biases selection
/// proportionally (spec §4.9 "weight-aware strategies").
#[derive(Default)]
pub struct WeightedRoundRobinBalance {
    cursor: AtomicU64,
}

#[async_trait]
impl LoadBalance for WeightedRoundRobinBalance {
    fn name(&self) -> &str {
        "weighted-round-robin"
    }

    async fn select(&self, candidates: &[Node], context: &SelectionContext) -> Result<Node> {
        let pool = filter_excluded(candidates, context);
        if pool.is_empty() {
            return Err(empty_pool(candidates.first().map(|n| n.url().interface()).unwrap_or("")));
        }
        let total_weight: u64 = pool.iter().map(|n| n.weight() as u64).sum();
        if total_weight == 0 {
            let idx = (self.cursor.fetch_add(1, Ordering::Relaxed) as usize) % pool.len();
            return Ok(pool[idx].clone());
        }
        let mut target = self.cursor.fetch_add(1, Ordering::Relaxed) % total_weight;
        for node in &pool {
            let w = node.weight() as u64;
            if target < w {
                return Ok(node.clone());
            }
            target -= w;
        }
        Ok(pool[0].clone())
    }
}

/// Tracks outstanding-call counts per endpoint (maintained externally by
/// the Invoker) and routes to whichever admissible node currently has the
/// fewest.
#[derive(Default)]
pub struct LeastActiveBalance {
    active: DashMap<String, AtomicU64>,
}

impl LeastActiveBalance {
    pub fn on_call_started(&self, node: &Node) {
        self.active.entry(node.url().endpoint_key()).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_call_finished(&self, node: &Node) {
        if let Some(counter) = self.active.get(&node.url().endpoint_key()) {
            counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1))).ok();
        }
    }

    fn active_count(&self, node: &Node) -> u64 {
        self.active.get(&node.url().endpoint_key()).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }
}

#[async_trait]
impl LoadBalance for LeastActiveBalance {
    fn name(&self) -> &str {
        "least-active"
    }

    async fn select(&self, candidates: &[Node], context: &SelectionContext) -> Result<Node> {
        let pool = filter_excluded(candidates, context);
        pool.into_iter()
            .min_by_key(|n| self.active_count(n))
            .ok_or_else(|| empty_pool(candidates.first().map(|n| n.url().interface()).unwrap_or("")))
    }
}

/// Hashes `context.sticky_key` (falling back to round-robin when absent) to
/// the same node across calls, for cache-affinity workloads.
pub struct ConsistentHashBalance {
    fallback: RoundRobinBalance,
}

impl Default for ConsistentHashBalance {
    fn default() -> Self {
        Self { fallback: RoundRobinBalance::default() }
    }
}

#[async_trait]
impl LoadBalance for ConsistentHashBalance {
    fn name(&self) -> &str {
        "consistent-hash"
    }

    async fn select(&self, candidates: &[Node], context: &SelectionContext) -> Result<Node> {
        let pool = filter_excluded(candidates, context);
        if pool.is_empty() {
            return Err(empty_pool(candidates.first().map(|n| n.url().interface()).unwrap_or("")));
        }
        match &context.sticky_key {
            Some(key) => {
                let hash = fnv1a(key.as_bytes());
                Ok(pool[(hash as usize) % pool.len()].clone())
            }
            None => self.fallback.select(candidates, context).await,
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub fn by_name(name: &str) -> Arc<dyn LoadBalance> {
    match name {
        "weighted-round-robin" => Arc::new(WeightedRoundRobinBalance::default()),
        "least-active" => Arc::new(LeastActiveBalance::default()),
        "consistent-hash" => Arc::new(ConsistentHashBalance::default()),
        _ => Arc::new(RoundRobinBalance::default()),
    }
}
