// SPDX-License-Identifier: Apache-2.0

//! The memory-limit enforcer (component C6): periodically reads each
//! monitored child's resident (and optionally virtual) memory size and
//! sends SIGTERM to any offender, relying on the process monitor's (C5)
//! restart logic to bring it back. The enforcer never inspects or kills the
//! master itself.

use std::sync::Arc;
use std::time::Duration;

use watchtower_clock::Clock;

/// Supplies the `(name, pid)` pairs currently under supervision. Kept
/// decoupled from `Monitor<S>`'s process-spec type parameter so the
/// enforcer does not need to be generic over it.
pub type PidLister = Arc<dyn Fn() -> Vec<(String, u32)> + Send + Sync>;

/// Reads one pid's resident and virtual memory size, in bytes. Production
/// code uses [`read_proc_statm`]; tests substitute a fixed table.
pub type MemoryReader = Arc<dyn Fn(u32) -> Option<(u64, u64)> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct MemoryLimitConfig {
    pub limit_bytes: u64,
    /// When `true`, only resident set size counts against the limit;
    /// otherwise virtual size is added in too.
    pub resident_only: bool,
    pub period: Duration,
}

/// Polls every monitored child's memory usage once per `period` and signals
/// SIGTERM to any whose usage exceeds `limit_bytes`.
pub struct MemoryEnforcer {
    clock: Arc<dyn Clock>,
    config: MemoryLimitConfig,
    pids: PidLister,
    reader: MemoryReader,
}

impl MemoryEnforcer {
    pub fn new(clock: Arc<dyn Clock>, config: MemoryLimitConfig, pids: PidLister) -> Self {
        Self::with_reader(clock, config, pids, Arc::new(read_proc_statm))
    }

    pub fn with_reader(
        clock: Arc<dyn Clock>,
        config: MemoryLimitConfig,
        pids: PidLister,
        reader: MemoryReader,
    ) -> Self {
        MemoryEnforcer {
            clock,
            config,
            pids,
            reader,
        }
    }

    /// Runs one poll of every monitored child, returning the names of any
    /// child that was over the limit and signaled this round.
    pub fn poll_once(&self) -> Vec<String> {
        let mut offenders = Vec::new();
        for (name, pid) in (self.pids)() {
            let Some((rss, vsz)) = (self.reader)(pid) else {
                continue;
            };
            let measured = if self.config.resident_only {
                rss
            } else {
                rss + vsz
            };
            if measured > self.config.limit_bytes {
                tracing::warn!(
                    process = %name,
                    pid,
                    measured_bytes = measured,
                    limit_bytes = self.config.limit_bytes,
                    "child exceeded memory limit, sending SIGTERM"
                );
                if let Err(err) = watchtower_spawn::signal::terminate(pid) {
                    tracing::warn!(process = %name, error = %err, "failed to signal over-limit child");
                }
                offenders.push(name);
            }
        }
        offenders
    }

    /// Schedules [`MemoryEnforcer::poll_once`] to run every `period`,
    /// rescheduling itself after each run for as long as `self` lives.
    pub fn start(self: &Arc<Self>) {
        self.schedule_next();
    }

    fn schedule_next(self: &Arc<Self>) {
        let enforcer = self.clone();
        self.clock.after(
            self.config.period,
            Box::new(move || {
                enforcer.poll_once();
                enforcer.schedule_next();
            }),
        );
    }
}

/// Reads `/proc/<pid>/statm` and returns `(resident_bytes, virtual_bytes)`.
/// Returns `None` if the process no longer exists or the file cannot be
/// parsed, matching the enforcer's policy of silently skipping a pid that
/// has already exited between the pid snapshot and the read.
pub fn read_proc_statm(pid: u32) -> Option<(u64, u64)> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let mut fields = contents.split_whitespace();
    let size_pages: u64 = fields.next()?.parse().ok()?;
    let resident_pages: u64 = fields.next()?.parse().ok()?;
    let page_size = page_size_bytes();
    Some((resident_pages * page_size, size_pages * page_size))
}

#[cfg(unix)]
fn page_size_bytes() -> u64 {
    // SAFETY: `sysconf` with `_SC_PAGESIZE` is always safe to call and
    // returns a small positive constant for the lifetime of the process.
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value > 0 {
        value as u64
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn page_size_bytes() -> u64 {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use watchtower_clock::ManualClock;

    fn config(limit_bytes: u64, resident_only: bool) -> MemoryLimitConfig {
        MemoryLimitConfig {
            limit_bytes,
            resident_only,
            period: Duration::from_secs(60),
        }
    }

    #[test]
    fn signals_only_the_child_over_the_limit() {
        let clock = Arc::new(ManualClock::new());
        let pids: PidLister = Arc::new(|| vec![("a".into(), 1), ("b".into(), 2)]);
        let reader: MemoryReader = Arc::new(|pid| match pid {
            1 => Some((100, 100)),
            2 => Some((10_000, 10_000)),
            _ => None,
        });
        let enforcer = MemoryEnforcer::with_reader(clock, config(1000, true), pids, reader);
        let offenders = enforcer.poll_once();
        assert_eq!(offenders, vec!["b".to_string()]);
    }

    #[test]
    fn resident_only_mode_ignores_virtual_size() {
        let clock = Arc::new(ManualClock::new());
        let pids: PidLister = Arc::new(|| vec![("a".into(), 1)]);
        let reader: MemoryReader = Arc::new(|_| Some((100, 1_000_000)));
        let enforcer = MemoryEnforcer::with_reader(clock, config(1000, true), pids, reader);
        assert!(enforcer.poll_once().is_empty());

        let clock = Arc::new(ManualClock::new());
        let pids: PidLister = Arc::new(|| vec![("a".into(), 1)]);
        let reader: MemoryReader = Arc::new(|_| Some((100, 1_000_000)));
        let enforcer = MemoryEnforcer::with_reader(clock, config(1000, false), pids, reader);
        assert_eq!(enforcer.poll_once(), vec!["a".to_string()]);
    }

    #[test]
    fn vanished_pid_between_snapshot_and_read_is_skipped_not_errored() {
        let clock = Arc::new(ManualClock::new());
        let pids: PidLister = Arc::new(|| vec![("a".into(), 999)]);
        let reader: MemoryReader = Arc::new(|_| None);
        let enforcer = MemoryEnforcer::with_reader(clock, config(1, true), pids, reader);
        assert!(enforcer.poll_once().is_empty());
    }

    #[test]
    fn polls_repeatedly_on_the_clock_period() {
        let clock = Arc::new(ManualClock::new());
        let calls = Arc::new(Mutex::new(0u32));
        let c = calls.clone();
        let pids: PidLister = Arc::new(move || {
            #[allow(clippy::unwrap_used)]
            {
                *c.lock().unwrap() += 1;
            }
            Vec::new()
        });
        let enforcer = Arc::new(MemoryEnforcer::new(clock.clone(), config(1, true), pids));
        enforcer.start();
        clock.advance(Duration::from_secs(60));
        clock.advance(Duration::from_secs(60));
        clock.advance(Duration::from_secs(60));
        #[allow(clippy::unwrap_used)]
        {
            assert_eq!(*calls.lock().unwrap(), 3);
        }
    }
}
