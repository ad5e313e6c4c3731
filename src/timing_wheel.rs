//! Hashed timing wheel for bulk deadline expiry (spec §4.1, §4.10).
//!
//! One wheel is shared per Transport rather than allocating a timer per
//! in-flight call — spec §4.1 explicitly calls out per-call timers as the
//! thing to avoid. `advance()` is driven by a single periodic task; the
//! granularity of that period is the `ε` referenced in spec §8's deadline
//! property.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

struct Slot<T> {
    entries: Mutex<Vec<(u64, T)>>,
}

/// A hashed timing wheel holding arbitrary tokens (here, request ids).
pub struct TimingWheel<T> {
    tick: Duration,
    slots: Vec<Slot<T>>,
    cursor: AtomicUsize,
}

impl<T: Clone + Send + 'static> TimingWheel<T> {
    pub fn new(tick: Duration, wheel_size: usize) -> Self {
        let slots = (0..wheel_size.max(1)).map(|_| Slot { entries: Mutex::new(Vec::new()) }).collect();
        Self { tick, slots, cursor: AtomicUsize::new(0) }
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick
    }

    /// Schedule `item` to expire no sooner than `delay` from now.
    pub fn schedule(&self, delay: Duration, item: T) {
        let wheel_size = self.slots.len() as u64;
        let tick_nanos = self.tick.as_nanos().max(1);
        let ticks = ((delay.as_nanos() / tick_nanos) as u64).max(1);

        let cursor = self.cursor.load(Ordering::Acquire) as u64;
        let target = cursor + ticks;
        let slot_idx = (target % wheel_size) as usize;
        let round = target / wheel_size;

        self.slots[slot_idx].entries.lock().push((round, item));
    }

    /// Advance the wheel by one tick, returning tokens whose round has
    /// elapsed. Entries with remaining rounds are kept in the same slot for
    /// the next revolution.
    pub fn advance(&self) -> Vec<T> {
        let cursor = self.cursor.fetch_add(1, Ordering::AcqRel) % self.slots.len();
        let current_round = (self.cursor.load(Ordering::Acquire) / self.slots.len()) as u64;

        let mut entries = self.slots[cursor].entries.lock();
        let mut expired = Vec::new();
        let mut kept = Vec::new();
        for (round, item) in entries.drain(..) {
            if round <= current_round {
                expired.push(item);
            } else {
                kept.push((round, item));
            }
        }
        *entries = kept;
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_expires_after_scheduled_ticks() {
        let wheel: TimingWheel<u64> = TimingWheel::new(Duration::from_millis(10), 8);
        wheel.schedule(Duration::from_millis(30), 42);

        let mut expired = Vec::new();
        for _ in 0..5 {
            expired.extend(wheel.advance());
        }
        assert_eq!(expired, vec![42]);
    }

    #[test]
    fn item_does_not_expire_before_its_round() {
        let wheel: TimingWheel<u64> = TimingWheel::new(Duration::from_millis(10), 4);
        wheel.schedule(Duration::from_millis(100), 7);

        let mut expired = Vec::new();
        for _ in 0..3 {
            expired.extend(wheel.advance());
        }
        assert!(expired.is_empty());
    }
}
