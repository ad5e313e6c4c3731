//! Invoker Core (spec §4.8, §4.9): the outermost call object binding an
//! interface to the network, as either a [`refer::Refer`] (client) or an
//! [`exporter::Exporter`] (server).

pub mod exporter;
pub mod refer;

use std::sync::atomic::{AtomicU8, Ordering};

/// Shared lifecycle for both Invoker kinds. Transitions are monotonic
/// forward and guarded by a single-shot switch (spec §4.7 "totally
/// ordered... single-shot switch"): once a `compare_exchange` into a state
/// succeeds, no other caller can also win that same transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InvokerState {
    New = 0,
    Opening = 1,
    Opened = 2,
    Closing = 3,
    Closed = 4,
}

impl InvokerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => InvokerState::New,
            1 => InvokerState::Opening,
            2 => InvokerState::Opened,
            3 => InvokerState::Closing,
            _ => InvokerState::Closed,
        }
    }
}

pub(crate) struct StateSwitch {
    state: AtomicU8,
}

impl StateSwitch {
    pub fn new() -> Self {
        Self { state: AtomicU8::new(InvokerState::New as u8) }
    }

    pub fn get(&self) -> InvokerState {
        InvokerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempt the one transition from `from` to `to`. Returns `true` only
    /// for the caller that actually performed it — concurrent callers
    /// racing the same transition all see `false` except the winner.
    pub fn try_transition(&self, from: InvokerState, to: InvokerState) -> bool {
        self.state.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
}
