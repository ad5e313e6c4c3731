//! Exporter (spec §4.9): the server-side Invoker — binds a business
//! implementation to a Server Transport port and, once it is accepting and
//! has passed a self-check, advertises itself through the Registry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::channel::RequestHandler;
use crate::descriptor::{DescriptorBuilder, DescriptorCache, InterfaceDescriptor};
use crate::error::{Result, RpcError};
use crate::filter::FilterChain;
use crate::node::{Node, NodeState};
use crate::registry::Registry;
use crate::request::{Request, Response};
use crate::transport::TcpServerTransport;
use crate::url::Url;

use super::{InvokerState, StateSwitch};

/// What to do with a request that arrives while the business executor is
/// already at capacity (spec §4.9).
#[derive(Debug, Clone, Copy)]
pub enum RejectionPolicy {
    Reject,
    CallerRuns,
    WaitBounded(Duration),
}

/// The user-supplied business logic an Exporter fronts. Unlike
/// [`RequestHandler`] this never sees wire concerns: by the time
/// `invoke` runs, alias and method have already been resolved.
#[async_trait]
pub trait ServiceImpl: Send + Sync {
    async fn invoke(&self, request: Request) -> Response;
}

/// Bounds concurrent in-flight dispatches and applies a [`RejectionPolicy`]
/// once that bound is hit, the way a bounded thread pool's saturation
/// policy does.
struct ExecutorPool {
    semaphore: Arc<Semaphore>,
    policy: RejectionPolicy,
}

impl ExecutorPool {
    fn new(capacity: usize, policy: RejectionPolicy) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(capacity.max(1))), policy }
    }

    async fn run<F, Fut>(&self, request_id: u64, task: F) -> Response
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Response>,
    {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(_permit) => task().await,
            Err(_) => match self.policy {
                RejectionPolicy::CallerRuns => task().await,
                RejectionPolicy::Reject => Response::remote_error(request_id, RpcError::Overload("executor saturated".into()).to_string(), true),
                RejectionPolicy::WaitBounded(bound) => {
                    match tokio::time::timeout(bound, Arc::clone(&self.semaphore).acquire_owned()).await {
                        Ok(Ok(_permit)) => task().await,
                        _ => Response::remote_error(request_id, RpcError::Overload("executor saturated past wait bound".into()).to_string(), true),
                    }
                }
            },
        }
    }
}

/// The concrete `RequestHandler` plugged into `TcpServerTransport`: decode
/// is already done by `Channel`, so this starts at descriptor lookup (spec
/// §4.9's dispatch pipeline).
struct Dispatcher {
    alias: String,
    descriptor: Arc<InterfaceDescriptor>,
    filter_chain: Arc<FilterChain>,
    executor: ExecutorPool,
    implementation: Arc<dyn ServiceImpl>,
    in_flight: AtomicUsize,
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, request: Request) -> Response {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let response = self.run(request).await;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        response
    }
}

impl Dispatcher {
    async fn run(&self, request: Request) -> Response {
        let descriptor = Arc::clone(&self.descriptor);
        let alias = self.alias.clone();
        let implementation = Arc::clone(&self.implementation);

        self.filter_chain
            .run(request, move |request| async move {
                if request.alias != alias {
                    return Response::remote_error(request.id, RpcError::NoSuchAlias(request.alias.clone()).to_string(), false);
                }
                if descriptor.method(&request.method).is_none() {
                    let err = RpcError::NoSuchMethod { interface: request.interface.clone(), method: request.method.clone() };
                    return Response::remote_error(request.id, err.to_string(), false);
                }

                let request_id = request.id;
                self.executor.run(request_id, move || async move { implementation.invoke(request).await }).await
            })
            .await
    }
}

pub struct ExporterConfig {
    pub interface: String,
    pub alias: String,
    pub bind_addr: String,
    pub payload_cap: usize,
    pub executor_capacity: usize,
    pub rejection_policy: RejectionPolicy,
    pub shutdown_deadline: Duration,
    pub expiry_tick: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            alias: "default".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            payload_cap: 4 << 20,
            executor_capacity: 256,
            rejection_policy: RejectionPolicy::Reject,
            shutdown_deadline: Duration::from_secs(5),
            expiry_tick: Duration::from_millis(100),
        }
    }
}

pub struct Exporter {
    config: ExporterConfig,
    registry: Arc<dyn Registry>,
    descriptors: Arc<DescriptorCache>,
    builder: Arc<dyn DescriptorBuilder>,
    implementation: Arc<dyn ServiceImpl>,
    filter_chain: Arc<FilterChain>,
    state: StateSwitch,
    dispatcher: once_cell::sync::OnceCell<Arc<Dispatcher>>,
    transport: once_cell::sync::OnceCell<Arc<TcpServerTransport>>,
    local_addr: std::sync::Mutex<Option<std::net::SocketAddr>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Exporter {
    pub fn new(
        config: ExporterConfig,
        registry: Arc<dyn Registry>,
        descriptors: Arc<DescriptorCache>,
        builder: Arc<dyn DescriptorBuilder>,
        implementation: Arc<dyn ServiceImpl>,
        filter_chain: FilterChain,
    ) -> Self {
        Self {
            config,
            registry,
            descriptors,
            builder,
            implementation,
            filter_chain: Arc::new(filter_chain),
            state: StateSwitch::new(),
            dispatcher: once_cell::sync::OnceCell::new(),
            transport: once_cell::sync::OnceCell::new(),
            local_addr: std::sync::Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> InvokerState {
        self.state.get()
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Bind, start accepting, self-check, then register (spec §4.9's
    /// ordering: "Registration with the Registry happens only after the
    /// Server Transport is listening and at least one successful
    /// self-check").
    pub async fn open(&self) -> Result<()> {
        if !self.state.try_transition(InvokerState::New, InvokerState::Opening) {
            return Ok(());
        }

        let descriptor = self.descriptors.get_or_build(&self.config.interface, &self.config.alias, self.builder.as_ref());
        let dispatcher = Arc::new(Dispatcher {
            alias: self.config.alias.clone(),
            descriptor,
            filter_chain: Arc::clone(&self.filter_chain),
            executor: ExecutorPool::new(self.config.executor_capacity, self.config.rejection_policy),
            implementation: Arc::clone(&self.implementation),
            in_flight: AtomicUsize::new(0),
        });
        let _ = self.dispatcher.set(Arc::clone(&dispatcher));

        let listener = TcpListener::bind(&self.config.bind_addr).await.map_err(RpcError::Io)?;
        let local_addr = listener.local_addr().map_err(RpcError::Io)?;
        *self.local_addr.lock().unwrap() = Some(local_addr);

        let transport = Arc::new(TcpServerTransport::new(dispatcher, self.config.payload_cap, self.config.expiry_tick, 256));
        let _ = self.transport.set(Arc::clone(&transport));

        let serve_transport = Arc::clone(&transport);
        let serve_handle = tokio::spawn(async move {
            let _ = serve_transport.serve_listener(listener).await;
        });
        let expiry_transport = Arc::clone(&transport);
        let expiry_tick = self.config.expiry_tick;
        let expiry_handle = tokio::spawn(async move {
            expiry_transport.run_expiry(expiry_tick).await;
        });
        self.tasks.lock().unwrap().extend([serve_handle, expiry_handle]);

        if !self.self_check(local_addr).await {
            self.abort_tasks();
            self.state.try_transition(InvokerState::Opening, InvokerState::Closed);
            return Err(RpcError::Init("exporter self-check failed".into()));
        }

        let node = Node::new(Url::new("tcp", &local_addr.ip().to_string(), local_addr.port(), &self.config.interface), Duration::from_millis(0));
        node.set_state(NodeState::Connected);
        self.registry.register(&node).await?;

        self.state.try_transition(InvokerState::Opening, InvokerState::Opened);
        Ok(())
    }

    async fn self_check(&self, addr: std::net::SocketAddr) -> bool {
        for _ in 0..10 {
            if TcpStream::connect(addr).await.is_ok() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Stop accepting, let in-flight dispatches finish (bounded by
    /// `shutdown_deadline`), deregister, then close every accepted channel
    /// (spec §4.9 / the graceful-shutdown scenario in spec §8).
    pub async fn close(&self) {
        if !self.state.try_transition(InvokerState::Opened, InvokerState::Closing)
            && !self.state.try_transition(InvokerState::Opening, InvokerState::Closing)
            && !self.state.try_transition(InvokerState::New, InvokerState::Closing)
        {
            return;
        }

        self.abort_tasks();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_deadline;
        if let Some(dispatcher) = self.dispatcher.get() {
            while dispatcher.in_flight.load(Ordering::Acquire) > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            // `in_flight` drops as soon as the handler produces a Response,
            // a beat before the channel's writer task actually flushes it;
            // let that last write land before the socket is torn down.
            tokio::time::sleep(Duration::from_millis(20).min(self.config.shutdown_deadline)).await;
        }

        if let Some(addr) = self.local_addr() {
            let _ = self.registry.deregister(&Url::new("tcp", &addr.ip().to_string(), addr.port(), &self.config.interface)).await;
        }

        if let Some(transport) = self.transport.get() {
            transport.close_all(RpcError::TransportClosed).await;
        }

        self.state.try_transition(InvokerState::Closing, InvokerState::Closed);
    }
}
