//! Heartbeat Engine: keeps one [`Channel`] alive and detects dead peers
//! (spec §4.3).
//!
//! Two modes: `Timing` emits a heartbeat on a fixed interval regardless of
//! traffic; `Idle` only emits one when the channel has been quiet for at
//! least the interval. `N` consecutive unacknowledged heartbeats (default
//! 3) transition the channel to dead: it is closed with `TransportDead` and
//! every pending call fails the same way.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{Channel, ChannelState};
use crate::error::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatMode {
    Timing,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Healthy,
    Suspected,
    Dead,
}

pub struct HeartbeatEngine {
    channel: Arc<Channel>,
    mode: HeartbeatMode,
    interval: Duration,
    failure_threshold: u32,
    consecutive_failures: AtomicU32,
    outstanding: std::sync::Mutex<Option<u64>>,
}

impl HeartbeatEngine {
    pub fn new(channel: Arc<Channel>, mode: HeartbeatMode, interval: Duration) -> Self {
        Self {
            channel,
            mode,
            interval,
            failure_threshold: 3,
            consecutive_failures: AtomicU32::new(0),
            outstanding: std::sync::Mutex::new(None),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn status(&self) -> PeerStatus {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures >= self.failure_threshold {
            PeerStatus::Dead
        } else if failures > 0 {
            PeerStatus::Suspected
        } else {
            PeerStatus::Healthy
        }
    }

    /// Run one tick of the engine: checks the previous heartbeat's ack,
    /// decides whether to send a new one, and declares the channel dead
    /// after `failure_threshold` consecutive misses. Intended to be driven
    /// by the same periodic task as the shared Transport's timing wheel.
    pub fn tick(&self) {
        if self.channel.state() == ChannelState::Closed {
            return;
        }

        {
            let mut outstanding = self.outstanding.lock().unwrap();
            if let Some(id) = *outstanding {
                if self.channel.heartbeat_acked(id) {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    *outstanding = None;
                } else {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    *outstanding = None;
                    if failures >= self.failure_threshold {
                        tracing::warn!(channel_id = self.channel.id(), failures, "channel declared dead");
                        self.channel.close(RpcError::TransportDead);
                        return;
                    }
                }
            }
        }

        let should_send = match self.mode {
            HeartbeatMode::Timing => true,
            HeartbeatMode::Idle => self.channel.idle_duration() >= self.interval,
        };

        if should_send {
            let id = self.channel.send_heartbeat();
            *self.outstanding.lock().unwrap() = Some(id);
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LengthPrefixedJsonCodec;
    use crate::timing_wheel::TimingWheel;
    use tokio::net::{TcpListener, TcpStream};

    async fn client_channel() -> (Arc<Channel>, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client_stream = TcpStream::connect(addr).await.unwrap();
        let server_stream = accept.await.unwrap();
        let wheel = Arc::new(TimingWheel::new(Duration::from_millis(10), 16));
        let client = Channel::spawn(client_stream, Arc::new(LengthPrefixedJsonCodec), 1 << 20, wheel, None, false);
        (client, server_stream)
    }

    #[tokio::test]
    async fn unacked_heartbeats_declare_the_channel_dead() {
        let (client, server_stream) = client_channel().await;
        drop(server_stream); // never answers, so heartbeats never get acked

        let engine = HeartbeatEngine::new(Arc::clone(&client), HeartbeatMode::Timing, Duration::from_millis(5)).with_failure_threshold(2);

        for _ in 0..2 {
            engine.tick();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        engine.tick();

        assert_eq!(engine.status(), PeerStatus::Dead);
        assert_eq!(client.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn acked_heartbeat_resets_failure_count() {
        // Server channel auto-acks any Heartbeat frame it receives
        // (Channel::dispatch_inbound), so a live loopback stays healthy.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let wheel = Arc::new(TimingWheel::new(Duration::from_millis(10), 16));
        let accept = {
            let wheel = Arc::clone(&wheel);
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                Channel::spawn(stream, Arc::new(LengthPrefixedJsonCodec), 1 << 20, wheel, None, true)
            })
        };
        let client_stream = TcpStream::connect(addr).await.unwrap();
        let client = Channel::spawn(client_stream, Arc::new(LengthPrefixedJsonCodec), 1 << 20, wheel, None, false);
        let _server = accept.await.unwrap();

        let engine = HeartbeatEngine::new(Arc::clone(&client), HeartbeatMode::Timing, Duration::from_millis(10));
        engine.tick();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.tick();

        assert_eq!(engine.status(), PeerStatus::Healthy);
        assert_eq!(client.state(), ChannelState::Opened);
    }
}
