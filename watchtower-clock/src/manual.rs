// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{Clock, TimerHandle};

struct Pending {
    deadline: Duration,
    sequence: u64,
    fired_or_canceled: Arc<AtomicBool>,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}
impl Eq for Pending {}
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse so `BinaryHeap` (a max-heap) pops the earliest deadline first;
        // ties broken by insertion order (lower sequence first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Deterministic virtual clock for tests. Time only moves when [`ManualClock::advance`]
/// is called; pending callbacks whose deadline has been reached fire
/// synchronously, in deadline order with ties broken by scheduling order.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<BinaryHeap<Pending>>>,
    now: Arc<AtomicU64>,
    next_sequence: Arc<AtomicU64>,
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock {
            inner: Arc::new(Mutex::new(BinaryHeap::new())),
            now: Arc::new(AtomicU64::new(0)),
            next_sequence: Arc::new(AtomicU64::new(0)),
        }
    }
}

struct ManualTimerHandle {
    fired_or_canceled: Arc<AtomicBool>,
}

impl TimerHandle for ManualTimerHandle {
    fn cancel(&self) -> bool {
        self.fired_or_canceled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn active(&self) -> bool {
        !self.fired_or_canceled.load(Ordering::SeqCst)
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves virtual time forward by `delta`, firing every pending callback
    /// whose deadline falls at or before the new `now`, in deadline order.
    pub fn advance(&self, delta: Duration) {
        let target = self.now.load(Ordering::SeqCst) + delta.as_nanos() as u64;
        self.now.store(target, Ordering::SeqCst);
        loop {
            let due = {
                #[allow(clippy::unwrap_used)]
                let mut heap = self.inner.lock().unwrap();
                match heap.peek() {
                    Some(p) if p.deadline.as_nanos() as u64 <= target => heap.pop(),
                    _ => None,
                }
            };
            let Some(mut pending) = due else { break };
            if pending
                .fired_or_canceled
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                #[allow(clippy::unwrap_used)]
                let callback = pending.callback.take().unwrap();
                callback();
            }
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.now.load(Ordering::SeqCst))
    }

    fn after(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> Box<dyn TimerHandle> {
        let fired_or_canceled = Arc::new(AtomicBool::new(false));
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let deadline = self.now() + delay;
        #[allow(clippy::unwrap_used)]
        self.inner.lock().unwrap().push(Pending {
            deadline,
            sequence,
            fired_or_canceled: fired_or_canceled.clone(),
            callback: Some(callback),
        });
        Box::new(ManualTimerHandle { fired_or_canceled })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn fires_in_deadline_order() {
        let clock = ManualClock::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, delay) in [("c", 3), ("a", 1), ("b", 2)] {
            let order = order.clone();
            clock.after(Duration::from_secs(delay), Box::new(move || {
                #[allow(clippy::unwrap_used)]
                order.lock().unwrap().push(label);
            }));
        }
        clock.advance(Duration::from_secs(5));
        #[allow(clippy::unwrap_used)]
        let order = order.lock().unwrap().clone();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn canceled_timer_never_fires() {
        let clock = ManualClock::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = clock.after(Duration::from_secs(1), Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(handle.cancel());
        clock.advance(Duration::from_secs(2));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn partial_advance_does_not_fire_future_timers() {
        let clock = ManualClock::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        clock.after(Duration::from_secs(10), Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        clock.advance(Duration::from_secs(5));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        clock.advance(Duration::from_secs(5));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
