//! Per-Channel pending-request table (spec §4.10).
//!
//! Backed by a single [`TimingWheel`] per Transport for deadline expiry
//! rather than a timer per call. Removal from the map is the only way an
//! entry completes; completing (or timing out) an id twice is a no-op,
//! which is what makes the handle returned by [`CallFutureRegistry::cancel`]
//! safe to drop without leaking the id slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::request::Response;
use crate::timing_wheel::TimingWheel;

struct PendingCall {
    deadline: Instant,
    method: String,
    responder: oneshot::Sender<Result<Response>>,
}

/// Completion handle returned to a caller awaiting one RPC response.
pub struct CallHandle {
    receiver: oneshot::Receiver<Result<Response>>,
}

impl CallHandle {
    pub async fn wait(self) -> Result<Response> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::TransportClosed),
        }
    }
}

/// The registry itself. One instance lives inside each [`crate::channel::Channel`].
pub struct CallFutureRegistry {
    pending: DashMap<u64, PendingCall>,
    wheel: Arc<TimingWheel<u64>>,
    next_id: AtomicU64,
}

impl CallFutureRegistry {
    pub fn new(wheel: Arc<TimingWheel<u64>>) -> Self {
        Self { pending: DashMap::new(), wheel, next_id: AtomicU64::new(1) }
    }

    /// Allocate an id not already present among pending entries (spec §4.1
    /// "the id allocator skips ids already present").
    pub fn allocate_id(&self) -> u64 {
        loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            if candidate != 0 && !self.pending.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Register a pending call and schedule its timeout on the shared wheel.
    pub fn register(&self, id: u64, method: impl Into<String>, timeout: Duration) -> CallHandle {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        self.pending.insert(id, PendingCall { deadline, method: method.into(), responder: tx });
        self.wheel.schedule(timeout, id);
        CallHandle { receiver: rx }
    }

    /// Complete a pending call. No-op if the id is unknown (already
    /// completed, timed out, or never registered) — spec §3 "Responses with
    /// unknown ids are logged and discarded."
    pub fn complete(&self, response: Response) {
        if let Some((_, pending)) = self.pending.remove(&response.id) {
            let _ = pending.responder.send(Ok(response));
        } else {
            tracing::debug!(id = response.id, "response for unknown or already-completed id, discarding");
        }
    }

    /// Sweep ids the wheel reports as expired, failing any still pending
    /// with `Timeout` (idempotent: an id already completed was removed from
    /// `pending` already, so the wheel firing for it is a no-op).
    pub fn expire_tick(&self) {
        for id in self.wheel.advance() {
            if let Some((_, pending)) = self.pending.remove(&id) {
                if pending.deadline <= Instant::now() {
                    let _ = pending.responder.send(Err(RpcError::Timeout(pending.deadline.elapsed())));
                } else {
                    // Woke early due to wheel granularity; re-schedule the remainder.
                    let remaining = pending.deadline.saturating_duration_since(Instant::now());
                    let method = pending.method.clone();
                    self.wheel.schedule(remaining, id);
                    self.pending.insert(id, pending);
                    let _ = method;
                }
            }
        }
    }

    /// Cancel explicitly. Idempotent and never leaks the id slot (spec §5).
    pub fn cancel(&self, id: u64) {
        self.pending.remove(&id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drain the whole registry, failing every entry with `error_factory`
    /// in ascending id order (spec §4.10 "drained... in id order").
    pub fn drain_with_error<F: Fn() -> RpcError>(&self, error_factory: F) {
        let mut ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.responder.send(Err(error_factory()));
            }
        }
    }
}
