//! Route (spec §4.9): composes address filters, sticky routing, and a
//! retry policy around a [`LoadBalance`] pick.

use std::time::Duration;

use crate::cluster::MembershipView;
use crate::error::RpcError;
use crate::loadbalance::{LoadBalance, SelectionContext};
use crate::node::Node;

/// Narrows the admissible set before load balancing runs, e.g. same-region
/// affinity or a tag-based allow list (spec §4.9 "address filters").
pub trait AddressFilter: Send + Sync {
    fn matches(&self, node: &Node) -> bool;
    fn name(&self) -> &str;
}

pub struct RegionAffinityFilter {
    region: String,
}

impl RegionAffinityFilter {
    pub fn new(region: impl Into<String>) -> Self {
        Self { region: region.into() }
    }
}

impl AddressFilter for RegionAffinityFilter {
    fn matches(&self, node: &Node) -> bool {
        node.region() == self.region
    }

    fn name(&self) -> &str {
        "region-affinity"
    }
}

#[derive(Debug, Clone)]
pub enum RetryStrategy {
    None,
    Fixed(Duration),
    ExponentialJitter { initial: Duration, max: Duration, multiplier: f64 },
}

impl RetryStrategy {
    fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryStrategy::None => None,
            RetryStrategy::Fixed(d) => Some(*d),
            RetryStrategy::ExponentialJitter { initial, max, multiplier } => {
                let base_ms = initial.as_millis() as f64 * multiplier.powi(attempt as i32);
                let jitter = rand::random::<f64>() * base_ms;
                Some(Duration::from_millis((base_ms + jitter) as u64).min(*max))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { strategy: RetryStrategy::None, max_attempts: 0 }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::ExponentialJitter { initial: Duration::from_millis(50), max: Duration::from_secs(2), multiplier: 2.0 },
            max_attempts: 2,
        }
    }
}

pub struct Route {
    filters: Vec<Box<dyn AddressFilter>>,
    balance: std::sync::Arc<dyn LoadBalance>,
    retry: RetryPolicy,
}

impl Route {
    pub fn new(balance: std::sync::Arc<dyn LoadBalance>) -> Self {
        Self { filters: Vec::new(), balance, retry: RetryPolicy::default() }
    }

    pub fn with_filter(mut self, filter: Box<dyn AddressFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn candidates(&self, view: &MembershipView) -> Vec<Node> {
        view.admissible().into_iter().filter(|n| self.filters.iter().all(|f| f.matches(n))).collect()
    }

    /// Pick one node, given everything already excluded this call (prior
    /// failed attempts re-enter the pool only if the caller clears
    /// `excluded`, per spec §4.9 "excluded-node re-entry" is opt-in per
    /// retry attempt, not automatic).
    pub async fn pick(&self, view: &MembershipView, context: &SelectionContext) -> crate::error::Result<Node> {
        let candidates = self.candidates(view);
        self.balance.select(&candidates, context).await
    }

    /// Drive `attempt` (given the node it should call) through the retry
    /// policy: on a retriable failure, excludes the failed node and sleeps
    /// the computed backoff before the caller tries again. Returns `Ok`
    /// from the first successful attempt, or the last error once attempts
    /// are exhausted.
    pub async fn call_with_retry<F, Fut, T>(&self, view: &MembershipView, mut attempt: F) -> crate::error::Result<T>
    where
        F: FnMut(Node) -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<T>>,
    {
        let mut context = SelectionContext::default();
        let mut last_err = RpcError::NoAvailableNode { interface: String::new(), alias: String::new() };

        for attempt_no in 0..=self.retry.max_attempts {
            let node = match self.pick(view, &context).await {
                Ok(n) => n,
                Err(e) => return Err(e),
            };
            match attempt(node.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt_no < self.retry.max_attempts => {
                    context.excluded.push(node.url().endpoint_key());
                    if let Some(delay) = self.retry.strategy.delay_for_attempt(attempt_no) {
                        tokio::time::sleep(delay).await;
                    }
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MembershipView;
    use crate::loadbalance::RoundRobinBalance;
    use crate::node::NodeState;
    use crate::url::Url;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn admissible_view(hosts: &[&str]) -> MembershipView {
        let nodes: Vec<Node> = hosts
            .iter()
            .map(|h| {
                let n = Node::new(Url::new("tcp", *h, 1, "Echo"), Duration::from_millis(0));
                n.set_state(NodeState::Connected);
                n
            })
            .collect();
        MembershipView::from_nodes(nodes)
    }

    #[tokio::test]
    async fn retry_reroutes_to_a_different_node_after_a_retriable_failure() {
        let view = admissible_view(&["a", "b"]);
        let route = Route::new(Arc::new(RoundRobinBalance::default())).with_retry(RetryPolicy { strategy: RetryStrategy::None, max_attempts: 1 });

        let calls = Arc::new(AtomicUsize::new(0));
        let seen_hosts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls_c = Arc::clone(&calls);
        let hosts_c = Arc::clone(&seen_hosts);

        let result: crate::error::Result<&'static str> = route
            .call_with_retry(&view, move |node| {
                let calls = Arc::clone(&calls_c);
                let hosts = Arc::clone(&hosts_c);
                async move {
                    hosts.lock().unwrap().push(node.url().host().to_string());
                    let n = calls.fetch_add(1, Ordering::Relaxed);
                    if n == 0 {
                        Err(RpcError::TransportClosed)
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(seen_hosts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn non_retriable_failure_stops_immediately() {
        let view = admissible_view(&["a"]);
        let route = Route::new(Arc::new(RoundRobinBalance::default()));
        let result: crate::error::Result<()> = route.call_with_retry(&view, |_| async { Err(RpcError::Remote("boom".into())) }).await;
        assert!(matches!(result, Err(RpcError::Remote(_))));
    }
}
