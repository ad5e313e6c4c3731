//! Pool of live [`Channel`]s keyed by endpoint (spec §4.2).
//!
//! One entry per `(endpoint, protocol)` pair. Reference-counted so a Refer
//! and a co-located Exporter sharing an endpoint share one connection
//! instead of dialing twice; failed dials are throttled per endpoint with
//! jittered exponential backoff rather than retried in a tight loop.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::{Channel, RequestHandler};
use crate::codec::Codec;
use crate::error::{Result, RpcError};
use crate::timing_wheel::TimingWheel;
use crate::url::Url;

/// Anything a [`Channel`] can be spawned over. Blanket-implemented so any
/// `AsyncRead + AsyncWrite + Send + Unpin` type (a `TcpStream`, a TLS
/// stream, an in-memory duplex pipe in tests) qualifies without the caller
/// naming this trait explicitly.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// Dials a fresh connection to an endpoint. One implementation per
/// transport kind (spec §5's Client Transport).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn AsyncIo>>;
}

struct BackoffState {
    attempts: u32,
    retry_after: Instant,
}

struct Entry {
    channel: Arc<Channel>,
    refs: AtomicUsize,
    /// Whether `endpoint.param_bool("share", true)` was true for the URL
    /// this entry was dialed under. Read back on `release` to decide
    /// whether a zero-ref entry should be torn down (spec §4.2).
    shared: bool,
}

/// Config knobs for reconnection backoff (spec §4.2 "jittered exponential
/// backoff").
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base: Duration::from_millis(200), max: Duration::from_secs(30) }
    }
}

fn jittered_delay(base: Duration, attempts: u32, max: Duration) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << attempts.min(16));
    let capped = exp.min(max.as_millis());
    let jitter_frac = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_millis(((capped as f64) * jitter_frac) as u64)
}

pub struct ChannelManager {
    entries: DashMap<String, Entry>,
    backoff: DashMap<String, BackoffState>,
    backoff_config: BackoffConfig,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn Codec>,
    payload_cap: usize,
    wheel: Arc<TimingWheel<u64>>,
    handler: Option<Arc<dyn RequestHandler>>,
    dial_attempts: AtomicI64,
}

impl ChannelManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        codec: Arc<dyn Codec>,
        payload_cap: usize,
        wheel: Arc<TimingWheel<u64>>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            backoff: DashMap::new(),
            backoff_config: BackoffConfig::default(),
            connector,
            codec,
            payload_cap,
            wheel,
            handler: None,
            dial_attempts: AtomicI64::new(0),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff_config = backoff;
        self
    }

    /// Acquire the channel for `endpoint`, dialing and registering a fresh
    /// one if none is live. Increments the reference count. Pooling is keyed
    /// on [`Url::endpoint_key`] (scheme + address), not the full `Url`, so a
    /// Refer and a co-located Exporter — or two interfaces — dialing the
    /// same host:port share one Channel (spec §4.2).
    pub async fn acquire(&self, endpoint: &Url) -> Result<Arc<Channel>> {
        let key = endpoint.endpoint_key();
        if let Some(entry) = self.entries.get(&key) {
            if entry.channel.state() != crate::channel::ChannelState::Closed {
                entry.refs.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&entry.channel));
            }
        }
        self.entries.remove_if(&key, |_, e| e.channel.state() == crate::channel::ChannelState::Closed);

        if let Some(state) = self.backoff.get(&key) {
            if Instant::now() < state.retry_after {
                return Err(RpcError::Transport(format!("{endpoint} is in backoff")));
            }
        }

        self.dial_attempts.fetch_add(1, Ordering::Relaxed);
        match self.connector.connect(endpoint).await {
            Ok(io) => {
                self.backoff.remove(&key);
                let channel = Channel::spawn(io, Arc::clone(&self.codec), self.payload_cap, Arc::clone(&self.wheel), self.handler.clone(), false);
                let shared = endpoint.param_bool("share", true);
                self.entries.insert(key, Entry { channel: Arc::clone(&channel), refs: AtomicUsize::new(1), shared });
                Ok(channel)
            }
            Err(e) => {
                let attempts = self.backoff.get(&key).map(|s| s.attempts + 1).unwrap_or(1);
                let delay = jittered_delay(self.backoff_config.base, attempts, self.backoff_config.max);
                self.backoff.insert(key, BackoffState { attempts, retry_after: Instant::now() + delay });
                tracing::warn!(%endpoint, attempts, ?delay, "dial failed, backing off");
                Err(e)
            }
        }
    }

    /// Release a previously acquired reference. If the count reaches zero
    /// and the URL does not request sharing, the Channel is closed and
    /// evicted immediately rather than left for `sweep_closed` to notice
    /// only after its socket dies (spec §4.2).
    pub fn release(&self, endpoint: &Url) {
        let key = endpoint.endpoint_key();
        let should_close = if let Some(entry) = self.entries.get(&key) {
            let remaining = entry.refs.fetch_sub(1, Ordering::AcqRel) - 1;
            remaining == 0 && !entry.shared
        } else {
            false
        };
        if should_close {
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.channel.close(RpcError::TransportClosed);
            }
        }
    }

    pub fn ref_count(&self, endpoint: &Url) -> usize {
        self.entries.get(&endpoint.endpoint_key()).map(|e| e.refs.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Drop any entries whose channel has transitioned to `Closed`.
    pub fn sweep_closed(&self) {
        self.entries.retain(|_, e| e.channel.state() != crate::channel::ChannelState::Closed);
    }

    /// Run every managed channel's Call Future Registry expiry sweep once.
    /// Intended to be driven by the same periodic task that advances the
    /// shared wheel (spec §4.10's deadline property).
    pub fn expire_all(&self) {
        for entry in self.entries.iter() {
            entry.channel.expire_tick();
        }
    }

    pub fn channel_count(&self) -> usize {
        self.entries.len()
    }

    pub fn dial_attempts(&self) -> i64 {
        self.dial_attempts.load(Ordering::Relaxed)
    }

    /// Close every managed channel (used during Transport/Refer teardown).
    pub fn close_all(&self, reason: RpcError) {
        for entry in self.entries.iter() {
            entry.channel.close(match reason {
                RpcError::TransportDead => RpcError::TransportDead,
                _ => RpcError::TransportClosed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    struct FailingConnector {
        calls: Counter,
    }

    #[async_trait]
    impl Connector for FailingConnector {
        async fn connect(&self, _url: &Url) -> Result<Box<dyn AsyncIo>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(RpcError::Transport("refused".into()))
        }
    }

    fn manager(connector: Arc<dyn Connector>) -> ChannelManager {
        ChannelManager::new(
            connector,
            Arc::new(crate::codec::LengthPrefixedJsonCodec),
            1 << 20,
            Arc::new(TimingWheel::new(Duration::from_millis(10), 16)),
        )
    }

    #[tokio::test]
    async fn failed_dial_enters_backoff_and_skips_immediate_redial() {
        let connector = Arc::new(FailingConnector { calls: Counter::new(0) });
        let mgr = manager(connector.clone());
        let endpoint = Url::new("tcp", "127.0.0.1", 9, "Echo");

        assert!(mgr.acquire(&endpoint).await.is_err());
        assert!(mgr.acquire(&endpoint).await.is_err());
        // Second acquire should have hit the backoff guard, not redialed.
        assert_eq!(connector.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn jitter_stays_within_bounds_and_respects_cap() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        for attempts in 0..10 {
            let d = jittered_delay(base, attempts, max);
            assert!(d <= max + Duration::from_millis(1));
        }
    }

    struct TcpConnector;

    #[async_trait]
    impl Connector for TcpConnector {
        async fn connect(&self, url: &Url) -> Result<Box<dyn AsyncIo>> {
            let stream = tokio::net::TcpStream::connect(url.address()).await.map_err(RpcError::Io)?;
            Ok(Box::new(stream))
        }
    }

    async fn accepting_listener() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((_stream, _)) = listener.accept().await else { break };
            }
        });
        addr
    }

    #[tokio::test]
    async fn two_urls_sharing_an_endpoint_reuse_one_channel() {
        let addr = accepting_listener().await;
        let mgr = manager(Arc::new(TcpConnector));

        let refer_url = Url::new("tcp", &addr.ip().to_string(), addr.port(), "Echo");
        let exporter_url = Url::new("tcp", &addr.ip().to_string(), addr.port(), "Health");

        let a = mgr.acquire(&refer_url).await.unwrap();
        let b = mgr.acquire(&exporter_url).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b), "same host:port must pool to one Channel regardless of interface");
        assert_eq!(mgr.channel_count(), 1);
    }

    #[tokio::test]
    async fn release_closes_a_non_shared_channel_once_refs_reach_zero() {
        let addr = accepting_listener().await;
        let mgr = manager(Arc::new(TcpConnector));
        let endpoint = Url::new("tcp", &addr.ip().to_string(), addr.port(), "Echo").with_param("share", "false");

        let channel = mgr.acquire(&endpoint).await.unwrap();
        assert_eq!(channel.state(), crate::channel::ChannelState::Opened);

        mgr.release(&endpoint);
        assert_eq!(channel.state(), crate::channel::ChannelState::Closed);
        assert_eq!(mgr.channel_count(), 0);
    }

    #[tokio::test]
    async fn release_leaves_a_shared_channel_open_at_zero_refs() {
        let addr = accepting_listener().await;
        let mgr = manager(Arc::new(TcpConnector));
        let endpoint = Url::new("tcp", &addr.ip().to_string(), addr.port(), "Echo");

        let channel = mgr.acquire(&endpoint).await.unwrap();
        mgr.release(&endpoint);
        assert_eq!(channel.state(), crate::channel::ChannelState::Opened);
        assert_eq!(mgr.channel_count(), 1);
    }
}
