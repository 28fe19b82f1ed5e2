// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{Clock, TimerHandle};

/// Production clock: `tokio::time::sleep` driving a detached task per
/// scheduled callback, matching the cancellation-token idiom used by the
/// periodic self-telemetry loop this crate's scheduler is grounded on.
pub struct TokioClock {
    started_at: Instant,
}

impl Default for TokioClock {
    fn default() -> Self {
        TokioClock {
            started_at: Instant::now(),
        }
    }
}

impl TokioClock {
    pub fn new() -> Self {
        Self::default()
    }
}

struct TokioTimerHandle {
    fired_or_canceled: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl TimerHandle for TokioTimerHandle {
    fn cancel(&self) -> bool {
        let canceled = self
            .fired_or_canceled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if canceled {
            self.task.abort();
        }
        canceled
    }

    fn active(&self) -> bool {
        !self.fired_or_canceled.load(Ordering::SeqCst)
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn after(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> Box<dyn TimerHandle> {
        let fired_or_canceled = Arc::new(AtomicBool::new(false));
        let flag = fired_or_canceled.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if flag
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                callback();
            }
        });
        Box::new(TokioTimerHandle {
            fired_or_canceled,
            task,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn fires_after_delay() {
        let clock = TokioClock::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let _handle = clock.after(Duration::from_millis(10), Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_before_fire_prevents_callback() {
        let clock = TokioClock::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = clock.after(Duration::from_millis(50), Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(handle.active());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
