//! Single duplex transport connection (spec §4.1).
//!
//! A `Channel` is the sole object that writes to and reads from one
//! connection. Writes are serialized through an mpsc queue (one writer
//! task); incoming frames are dispatched to the matching pending Call
//! Future, the heartbeat handler, or a server-side request handler.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};

use crate::call_future::{CallFutureRegistry, CallHandle};
use crate::codec::{self, Codec, Direction, Frame};
use crate::error::{Result, RpcError};
use crate::request::{Request, Response};
use crate::timing_wheel::TimingWheel;

/// Server-side dispatch target: decode -> locate -> filter chain -> this.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Opening = 0,
    Opened = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelState::Opening,
            1 => ChannelState::Opened,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

/// Per-channel attribute bag (payload cap, heartbeat mode, business executor
/// name, ...), addressed by string key like the teacher's connection
/// metadata maps.
#[derive(Default)]
pub struct Attributes {
    values: DashMap<String, String>,
}

impl Attributes {
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub struct Channel {
    id: u64,
    is_server: bool,
    state: AtomicU8,
    payload_cap: usize,
    write_tx: mpsc::Sender<Frame>,
    calls: Arc<CallFutureRegistry>,
    attributes: Attributes,
    last_read_millis: AtomicU64,
    last_write_millis: AtomicU64,
    created_at: Instant,
    closed_notify: Arc<Notify>,
    heartbeat_counter: AtomicU64,
    last_heartbeat_ack: AtomicU64,
    heartbeat_ack_notify: Arc<Notify>,
    close_once: AtomicBool,
}

/// High watermark for the write queue; exceeding it while backpressure is
/// on yields `SendFull` (spec §4.1).
const DEFAULT_WATERMARK: usize = 1024;

impl Channel {
    /// Spawn read/write loops over `io` and return the shared handle.
    /// `handler` is `Some` for server-side channels dispatching inbound
    /// Requests; `None` for client-side channels (which only expect
    /// Responses/HeartbeatAcks on read).
    pub fn spawn<IO>(
        io: IO,
        codec: Arc<dyn Codec>,
        payload_cap: usize,
        wheel: Arc<TimingWheel<u64>>,
        handler: Option<Arc<dyn RequestHandler>>,
        is_server: bool,
    ) -> Arc<Channel>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(io);
        let (write_tx, mut write_rx) = mpsc::channel::<Frame>(DEFAULT_WATERMARK);

        let channel = Arc::new(Channel {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            is_server,
            state: AtomicU8::new(ChannelState::Opened as u8),
            payload_cap,
            write_tx,
            calls: Arc::new(CallFutureRegistry::new(wheel)),
            attributes: Attributes::default(),
            last_read_millis: AtomicU64::new(now_millis()),
            last_write_millis: AtomicU64::new(now_millis()),
            created_at: Instant::now(),
            closed_notify: Arc::new(Notify::new()),
            heartbeat_counter: AtomicU64::new(0),
            last_heartbeat_ack: AtomicU64::new(0),
            heartbeat_ack_notify: Arc::new(Notify::new()),
            close_once: AtomicBool::new(false),
        });

        // Writer task: FIFO from the caller's perspective (spec §4.1).
        {
            let channel = Arc::clone(&channel);
            let codec = Arc::clone(&codec);
            tokio::spawn(async move {
                let mut buf = BytesMut::new();
                while let Some(frame) = write_rx.recv().await {
                    if let Err(e) = codec.encode(&frame, &mut buf) {
                        tracing::warn!(error = %e, "failed to encode frame");
                        continue;
                    }
                    if let Err(e) = writer.write_all(&buf).await {
                        tracing::warn!(error = %e, "write failed, closing channel");
                        channel.close(RpcError::TransportClosed);
                        break;
                    }
                    buf.clear();
                    channel.last_write_millis.store(now_millis(), Ordering::Relaxed);
                }
                let _ = writer.shutdown().await;
            });
        }

        // Reader task: dispatch to Call Future Registry, heartbeat, or
        // server-side handler.
        {
            let channel = Arc::clone(&channel);
            let codec = Arc::clone(&codec);
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut buf = BytesMut::with_capacity(4096);
                let mut tmp = [0u8; 4096];
                loop {
                    match reader.read(&mut tmp).await {
                        Ok(0) => {
                            channel.close(RpcError::TransportClosed);
                            break;
                        }
                        Ok(n) => {
                            buf.extend_from_slice(&tmp[..n]);
                            channel.last_read_millis.store(now_millis(), Ordering::Relaxed);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "read failed, closing channel");
                            channel.close(RpcError::TransportClosed);
                            break;
                        }
                    }

                    loop {
                        match codec.decode(&mut buf) {
                            Ok(Some(frame)) => channel.dispatch_inbound(frame, handler.as_ref()).await,
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(error = %e, "decode failed, closing channel");
                                channel.close(RpcError::TransportClosed);
                                return;
                            }
                        }
                    }

                    if channel.state() == ChannelState::Closed {
                        break;
                    }
                }
            });
        }

        channel
    }

    async fn dispatch_inbound(self: &Arc<Self>, frame: Frame, handler: Option<&Arc<dyn RequestHandler>>) {
        match frame.direction {
            Direction::Response => match codec::decode_response(&frame) {
                Ok(response) => self.calls.complete(response),
                Err(e) => tracing::warn!(error = %e, "failed to decode response frame"),
            },
            Direction::Request => {
                if let Some(handler) = handler {
                    match codec::decode_request(&frame) {
                        Ok(request) => {
                            let handler = Arc::clone(handler);
                            let this = Arc::clone(self);
                            tokio::spawn(async move {
                                let response = handler.handle(request).await;
                                let _ = this.send_response(response).await;
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to decode request frame"),
                    }
                } else {
                    tracing::debug!("ignoring inbound request frame on a client-only channel");
                }
            }
            Direction::Heartbeat => {
                let _ = self.write_tx.try_send(codec::heartbeat_frame(frame.id, true));
            }
            Direction::HeartbeatAck => {
                self.last_heartbeat_ack.store(frame.id, Ordering::Relaxed);
                self.heartbeat_ack_notify.notify_waiters();
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_duration(&self) -> Duration {
        let last = self.last_read_millis.load(Ordering::Relaxed).max(self.last_write_millis.load(Ordering::Relaxed));
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    pub fn pending_count(&self) -> usize {
        self.calls.pending_count()
    }

    /// Submit a request and await its response. Fails fast with `Closed`,
    /// `OverPayload`, or `SendFull`; otherwise drives a `Timeout` through the
    /// shared timing wheel (spec §4.1).
    pub async fn submit(self: &Arc<Self>, mut request: Request) -> Result<Response> {
        if self.state() != ChannelState::Opened {
            return Err(RpcError::TransportClosed);
        }

        let id = self.calls.allocate_id();
        request.id = id;

        let frame = codec::encode_request(&request)?;
        codec::check_payload_cap(frame.payload.len(), self.payload_cap)?;

        let handle: CallHandle = self.calls.register(id, request.method.clone(), request.timeout);

        match self.write_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.calls.cancel(id);
                return Err(RpcError::SendFull);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.calls.cancel(id);
                return Err(RpcError::TransportClosed);
            }
        }

        handle.wait().await
    }

    pub async fn send_response(&self, response: Response) -> Result<()> {
        let frame = codec::encode_response(&response)?;
        codec::check_payload_cap(frame.payload.len(), self.payload_cap)?;
        self.write_tx.send(frame).await.map_err(|_| RpcError::TransportClosed)
    }

    /// Fire a heartbeat request; returns the locally-allocated heartbeat id
    /// so the caller (the Heartbeat Engine) can check for its ack later.
    /// Heartbeat frames use a distinct `Direction`, never a Call Future
    /// Registry id slot (spec §4.3's "dedicated id space or distinct frame
    /// type" — this crate picks the latter, recorded in DESIGN.md).
    pub fn send_heartbeat(&self) -> u64 {
        let id = self.heartbeat_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.write_tx.try_send(codec::heartbeat_frame(id, false));
        id
    }

    pub fn heartbeat_acked(&self, id: u64) -> bool {
        self.last_heartbeat_ack.load(Ordering::Relaxed) >= id
    }

    pub fn call_registry(&self) -> &CallFutureRegistry {
        &self.calls
    }

    /// Run the Call Future Registry's expiry sweep once. Intended to be
    /// driven by the same periodic task that advances the shared wheel.
    pub fn expire_tick(&self) {
        self.calls.expire_tick();
    }

    /// Close the channel. Idempotent and reentrant (spec §4.1): every
    /// pending Request fails with the given reason exactly once.
    pub fn close(self: &Arc<Self>, reason: RpcError) {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.store(ChannelState::Closed as u8, Ordering::Release);
        let dead = matches!(reason, RpcError::TransportDead);
        self.calls.drain_with_error(move || if dead { RpcError::TransportDead } else { RpcError::TransportClosed });
        self.closed_notify.notify_waiters();
    }

    pub async fn closed(&self) {
        if self.state() == ChannelState::Closed {
            return;
        }
        self.closed_notify.notified().await;
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LengthPrefixedJsonCodec;
    use tokio::net::{TcpListener, TcpStream};

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: Request) -> Response {
            let reversed: String = request.args[0].as_str().unwrap_or("").chars().rev().collect();
            Response::ok(request.id, serde_json::json!(reversed))
        }
    }

    async fn loopback() -> (Arc<Channel>, Arc<Channel>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let wheel = Arc::new(TimingWheel::new(Duration::from_millis(20), 64));

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            stream
        });
        let client_stream = TcpStream::connect(addr).await.unwrap();
        let server_stream = accept.await.unwrap();

        let client = Channel::spawn(client_stream, Arc::new(LengthPrefixedJsonCodec), 1 << 20, Arc::clone(&wheel), None, false);
        let server = Channel::spawn(server_stream, Arc::new(LengthPrefixedJsonCodec), 1 << 20, wheel, Some(Arc::new(Echo)), true);
        (client, server)
    }

    #[tokio::test]
    async fn happy_call_round_trip() {
        let (client, _server) = loopback().await;
        let req = Request::new("Echo", "echo", vec![serde_json::json!("abc")]);
        let response = client.submit(req).await.unwrap();
        match response.outcome {
            crate::request::Outcome::Ok(v) => assert_eq!(v, serde_json::json!("cba")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_fails_all_pending_exactly_once() {
        let (client, _server) = loopback().await;
        let req = Request::new("Echo", "slow", vec![serde_json::json!("x")]);
        let id_future = client.submit(req);

        client.close(RpcError::TransportClosed);
        let result = id_future.await;
        assert!(matches!(result, Err(RpcError::TransportClosed)));

        client.close(RpcError::TransportDead); // reentrant, must not panic
        assert_eq!(client.pending_count(), 0);
    }
}
