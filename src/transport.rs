//! Client/Server Transport (spec §5): the process-wide owner of one
//! listening socket or one shared timing wheel driving its channels.
//!
//! `TcpClientTransport`/`TcpServerTransport` are the one concrete reference
//! implementation; anything speaking `AsyncRead + AsyncWrite` can plug in
//! through [`crate::channel_manager::Connector`] instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use crate::channel::{Channel, RequestHandler};
use crate::channel_manager::{AsyncIo, ChannelManager, Connector};
use crate::codec::{Codec, LengthPrefixedJsonCodec};
use crate::error::{Result, RpcError};
use crate::heartbeat::{HeartbeatEngine, HeartbeatMode};
use crate::timing_wheel::TimingWheel;
use crate::url::Url;

pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn AsyncIo>> {
        let stream = TcpStream::connect(url.address()).await.map_err(RpcError::Io)?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}

/// Client-side Transport: one shared timing wheel, one [`ChannelManager`],
/// and a background sweep task driving both the wheel's expiry and every
/// managed channel's heartbeat.
pub struct TcpClientTransport {
    manager: Arc<ChannelManager>,
    wheel: Arc<TimingWheel<u64>>,
    heartbeats: RwLock<Vec<Arc<HeartbeatEngine>>>,
    tick: Duration,
}

impl TcpClientTransport {
    pub fn new(payload_cap: usize, tick: Duration, wheel_size: usize) -> Self {
        let wheel = Arc::new(TimingWheel::new(tick, wheel_size));
        let manager = Arc::new(ChannelManager::new(Arc::new(TcpConnector), Arc::new(LengthPrefixedJsonCodec), payload_cap, Arc::clone(&wheel)));
        Self { manager, wheel, heartbeats: RwLock::new(Vec::new()), tick }
    }

    pub fn manager(&self) -> Arc<ChannelManager> {
        Arc::clone(&self.manager)
    }

    /// Open (or reuse) a channel to `endpoint` and attach a heartbeat
    /// engine to it in the requested mode.
    pub async fn open(&self, endpoint: &Url, heartbeat_mode: HeartbeatMode, heartbeat_interval: Duration) -> Result<Arc<Channel>> {
        let channel = self.manager.acquire(endpoint).await?;
        let engine = Arc::new(HeartbeatEngine::new(Arc::clone(&channel), heartbeat_mode, heartbeat_interval));
        self.heartbeats.write().await.push(engine);
        Ok(channel)
    }

    /// Drive the shared wheel, per-channel call expiry, and heartbeat
    /// engines forever. Spawn this once per Transport instance.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.tick);
        loop {
            ticker.tick().await;
            self.manager.expire_all();
            self.manager.sweep_closed();
            let heartbeats = self.heartbeats.read().await;
            for engine in heartbeats.iter() {
                engine.tick();
            }
        }
    }

    pub fn close_all(&self) {
        self.manager.close_all(RpcError::TransportClosed);
    }
}

/// Server-side Transport: owns the listening socket and spawns a `Channel`
/// per accepted connection, wired to `handler` for inbound Requests.
pub struct TcpServerTransport {
    wheel: Arc<TimingWheel<u64>>,
    codec: Arc<dyn Codec>,
    payload_cap: usize,
    handler: Arc<dyn RequestHandler>,
    channels: RwLock<Vec<Arc<Channel>>>,
}

impl TcpServerTransport {
    pub fn new(handler: Arc<dyn RequestHandler>, payload_cap: usize, tick: Duration, wheel_size: usize) -> Self {
        Self {
            wheel: Arc::new(TimingWheel::new(tick, wheel_size)),
            codec: Arc::new(LengthPrefixedJsonCodec),
            payload_cap,
            handler,
            channels: RwLock::new(Vec::new()),
        }
    }

    /// Bind and accept connections until the listener errors or is dropped.
    pub async fn serve(self: Arc<Self>, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr).await.map_err(RpcError::Io)?;
        self.serve_listener(listener).await
    }

    /// Accept connections on an already-bound listener. Split out from
    /// `serve` so a caller that needs the resolved local address before
    /// announcing itself (an Exporter binding an ephemeral port, for
    /// instance) can bind first and hand the listener over.
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.map_err(RpcError::Io)?;
            stream.set_nodelay(true).ok();
            tracing::debug!(%peer, "accepted connection");
            let channel = Channel::spawn(stream, Arc::clone(&self.codec), self.payload_cap, Arc::clone(&self.wheel), Some(Arc::clone(&self.handler)), true);
            self.channels.write().await.push(channel);
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Drive the shared wheel's call-timeout expiry for every accepted
    /// channel. Spawn this once per Transport instance alongside `serve`.
    pub async fn run_expiry(self: Arc<Self>, tick: Duration) {
        let mut ticker = tokio::time::interval(tick);
        loop {
            ticker.tick().await;
            let channels = self.channels.read().await;
            for channel in channels.iter() {
                channel.expire_tick();
            }
        }
    }

    pub async fn close_all(&self, reason: RpcError) {
        for channel in self.channels.read().await.iter() {
            channel.close(match reason {
                RpcError::TransportDead => RpcError::TransportDead,
                _ => RpcError::TransportClosed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Outcome, Request, Response};

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: Request) -> Response {
            Response::ok(request.id, request.args[0].clone())
        }
    }

    #[tokio::test]
    async fn client_and_server_transport_round_trip() {
        // Reserve an ephemeral port up front so the client knows where to
        // dial before the server task starts listening on it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let server = Arc::new(TcpServerTransport::new(Arc::new(Echo), 1 << 20, Duration::from_millis(10), 16));
        let server_clone = Arc::clone(&server);
        let bind_addr = addr.to_string();
        tokio::spawn(async move { server_clone.serve(&bind_addr).await.ok() });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client_transport = Arc::new(TcpClientTransport::new(1 << 20, Duration::from_millis(10), 16));
        let url = Url::new("tcp", &addr.ip().to_string(), addr.port(), "Echo");
        let channel = client_transport.open(&url, HeartbeatMode::Idle, Duration::from_secs(5)).await.unwrap();

        let request = Request::new("Echo", "echo", vec![serde_json::json!("hi")]);
        let response = channel.submit(request).await.unwrap();
        match response.outcome {
            Outcome::Ok(v) => assert_eq!(v, serde_json::json!("hi")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
