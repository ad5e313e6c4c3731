//! Refer (spec §4.8): the client-side Invoker — a caller's local proxy
//! bound to a Cluster, a Route, and a Filter Chain.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::channel_manager::ChannelManager;
use crate::cluster::{Cluster, MembershipChange};
use crate::error::{Result, RpcError};
use crate::filter::FilterChain;
use crate::node::{Node, NodeState};
use crate::registry::Registry;
use crate::request::{Request, Response};
use crate::route::Route;

use super::{InvokerState, StateSwitch};

pub struct ReferConfig {
    pub interface: String,
    pub alias: String,
    pub warm_up: Duration,
    pub shutdown_deadline: Duration,
}

impl Default for ReferConfig {
    fn default() -> Self {
        Self { interface: String::new(), alias: "default".to_string(), warm_up: Duration::from_secs(0), shutdown_deadline: Duration::from_secs(5) }
    }
}

pub struct Refer {
    config: ReferConfig,
    cluster: Arc<Cluster>,
    registry: Arc<dyn Registry>,
    manager: Arc<ChannelManager>,
    route: Route,
    filter_chain: FilterChain,
    state: StateSwitch,
    subscription: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Refer {
    pub fn new(config: ReferConfig, registry: Arc<dyn Registry>, manager: Arc<ChannelManager>, route: Route, filter_chain: FilterChain) -> Self {
        let cluster = Arc::new(Cluster::new(config.interface.clone(), config.warm_up));
        Self { config, cluster, registry, manager, route, filter_chain, state: StateSwitch::new(), subscription: std::sync::Mutex::new(None) }
    }

    pub fn state(&self) -> InvokerState {
        self.state.get()
    }

    /// Builds the `on_change` callback passed to `Cluster::apply`: every
    /// newly Added node starts in `Candidate` and is not yet admissible
    /// (spec §4.3's node lifecycle), so dial it in the background and
    /// promote it to `Connected` once the channel is up. `Node::clone`
    /// shares the same `Arc<AtomicU8>` state cell, so this mutation is
    /// visible through every other clone of the same node, including the
    /// one held in the Cluster's `MembershipView`.
    fn connect_on_add(manager: Arc<ChannelManager>) -> impl FnMut(&Node, MembershipChange) + Send + 'static {
        move |node: &Node, change: MembershipChange| {
            if change != MembershipChange::Added {
                return;
            }
            let manager = Arc::clone(&manager);
            let node = node.clone();
            tokio::spawn(async move {
                match manager.acquire(node.url()).await {
                    Ok(_) => node.set_state(NodeState::Connected),
                    Err(_) => node.set_state(NodeState::Dead),
                }
            });
        }
    }

    /// Resolves once the initial registry snapshot has been applied to the
    /// Cluster (spec §4.8). Idempotent: a second call while already
    /// `Opened` is a no-op; a call while `Opening` elsewhere waits is not
    /// supported here (concurrent opens from two callers are not part of
    /// this crate's contract — the caller owns one `Refer` per interface).
    pub async fn open(&self) -> Result<()> {
        if self.state.get() == InvokerState::Opened {
            return Ok(());
        }
        if !self.state.try_transition(InvokerState::New, InvokerState::Opening) {
            return Ok(());
        }

        let mut rx = self.registry.subscribe_cluster(&self.config.interface).await?;
        if let Some(first) = rx.recv().await {
            self.cluster.apply(first, &mut Self::connect_on_add(Arc::clone(&self.manager)));
        }

        let cluster = Arc::clone(&self.cluster);
        let manager = Arc::clone(&self.manager);
        let handle = tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                cluster.apply(snapshot, &mut Self::connect_on_add(Arc::clone(&manager)));
            }
        });
        *self.subscription.lock().unwrap() = Some(handle);

        self.state.try_transition(InvokerState::Opening, InvokerState::Opened);
        Ok(())
    }

    /// Dispatch one call: Filter Chain → Route → Cluster pick → Channel
    /// send (spec §4.8's data flow). Fails fast with `InvokerClosed` once
    /// `close()` has been entered.
    pub async fn invoke(&self, request: Request) -> Result<Response> {
        match self.state.get() {
            InvokerState::Opened => {}
            InvokerState::Opening | InvokerState::New => return Err(RpcError::Init("refer not opened".into())),
            _ => return Err(RpcError::InvokerClosed),
        }

        let view = self.cluster.view();
        let manager = Arc::clone(&self.manager);
        let route = &self.route;

        let response = self
            .filter_chain
            .run(request, |request| async move {
                let result = route
                    .call_with_retry(&view, |node| {
                        let manager = Arc::clone(&manager);
                        let request = request.clone();
                        async move {
                            let channel = manager.acquire(node.url()).await?;
                            channel.submit(request).await
                        }
                    })
                    .await;
                match result {
                    Ok(response) => response,
                    Err(e) => Response::remote_error(request.id, e.to_string(), e.is_retriable()),
                }
            })
            .await;

        match response.outcome {
            crate::request::Outcome::RemoteError { message, .. } if message.is_empty() => {
                Err(RpcError::Remote("empty remote error".into()))
            }
            _ => Ok(response),
        }
    }

    /// Stop accepting new invokes, release every managed Channel, and
    /// unsubscribe from the Registry (spec §4.8). Idempotent.
    pub async fn close(&self) {
        if !self.state.try_transition(InvokerState::Opened, InvokerState::Closing)
            && !self.state.try_transition(InvokerState::Opening, InvokerState::Closing)
            && !self.state.try_transition(InvokerState::New, InvokerState::Closing)
        {
            return;
        }

        if let Some(handle) = self.subscription.lock().unwrap().take() {
            handle.abort();
        }

        let _ = tokio::time::timeout(self.config.shutdown_deadline, async { self.manager.close_all(RpcError::TransportClosed) }).await;
        let _ = self.registry.deregister(&crate::url::Url::new("tcp", "", 0, &self.config.interface)).await;

        self.state.try_transition(InvokerState::Closing, InvokerState::Closed);
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }
}
