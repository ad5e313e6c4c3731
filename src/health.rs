//! Health Probe (spec §4.5): aggregates pluggable `HealthDoctor`s into one
//! verdict per Channel.

use async_trait::async_trait;

use crate::channel::{Channel, ChannelState};
use crate::heartbeat::{HeartbeatEngine, PeerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthVerdict {
    Healthy,
    Exhausted,
    Dead,
}

/// One health signal. Plugins are polled in registration order and the
/// worst verdict wins (spec §4.5 "aggregation is pessimistic").
#[async_trait]
pub trait HealthDoctor: Send + Sync {
    fn name(&self) -> &str;
    async fn diagnose(&self, channel: &Channel) -> HealthVerdict;
}

/// Flags a channel exhausted once its pending-call count crosses a
/// configured watermark, ahead of the send queue actually filling up.
pub struct PendingCallWatermark {
    pub watermark: usize,
}

#[async_trait]
impl HealthDoctor for PendingCallWatermark {
    fn name(&self) -> &str {
        "pending-call-watermark"
    }

    async fn diagnose(&self, channel: &Channel) -> HealthVerdict {
        if channel.state() == ChannelState::Closed {
            HealthVerdict::Dead
        } else if channel.pending_count() >= self.watermark {
            HealthVerdict::Exhausted
        } else {
            HealthVerdict::Healthy
        }
    }
}

/// Reads a channel's attached [`HeartbeatEngine`] status directly, so a
/// channel already declared dead by missed heartbeats doesn't have to wait
/// for its next `PendingCallWatermark` poll to be reflected here.
pub struct HeartbeatDoctor {
    pub engine: std::sync::Arc<HeartbeatEngine>,
}

#[async_trait]
impl HealthDoctor for HeartbeatDoctor {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn diagnose(&self, _channel: &Channel) -> HealthVerdict {
        match self.engine.status() {
            PeerStatus::Healthy => HealthVerdict::Healthy,
            PeerStatus::Suspected => HealthVerdict::Exhausted,
            PeerStatus::Dead => HealthVerdict::Dead,
        }
    }
}

pub struct HealthProbe {
    doctors: Vec<Box<dyn HealthDoctor>>,
}

impl HealthProbe {
    pub fn new(doctors: Vec<Box<dyn HealthDoctor>>) -> Self {
        Self { doctors }
    }

    pub async fn diagnose(&self, channel: &Channel) -> HealthVerdict {
        let mut worst = HealthVerdict::Healthy;
        for doctor in &self.doctors {
            let verdict = doctor.diagnose(channel).await;
            if verdict > worst {
                worst = verdict;
            }
        }
        worst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LengthPrefixedJsonCodec;
    use crate::timing_wheel::TimingWheel;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn channel() -> Arc<Channel> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client_stream = TcpStream::connect(addr).await.unwrap();
        let _server_stream = accept.await.unwrap();
        let wheel = Arc::new(TimingWheel::new(Duration::from_millis(10), 16));
        Channel::spawn(client_stream, Arc::new(LengthPrefixedJsonCodec), 1 << 20, wheel, None, false)
    }

    #[tokio::test]
    async fn worst_verdict_wins_across_doctors() {
        let ch = channel().await;
        let probe = HealthProbe::new(vec![
            Box::new(PendingCallWatermark { watermark: 1000 }),
            Box::new(PendingCallWatermark { watermark: 0 }), // always exhausted once any call is pending
        ]);
        assert_eq!(probe.diagnose(&ch).await, HealthVerdict::Exhausted);
    }

    #[tokio::test]
    async fn a_closed_channel_is_always_dead() {
        let ch = channel().await;
        ch.close(crate::error::RpcError::TransportClosed);
        let probe = HealthProbe::new(vec![Box::new(PendingCallWatermark { watermark: 1000 })]);
        assert_eq!(probe.diagnose(&ch).await, HealthVerdict::Dead);
    }
}
