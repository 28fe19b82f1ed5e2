// SPDX-License-Identifier: Apache-2.0

//! The process monitor (component C5): tracks a named set of child
//! processes, starts them staggered, restarts them on unexpected exit with
//! exponential back-off, and stops them in reverse registration order with a
//! SIGTERM/SIGKILL grace period.
//!
//! Modeled directly on `DelayedStartupProcessMonitor`'s `addProcess`,
//! `startService`, `reallyStartProcess`, `processEnded`, `stopProcess`,
//! `stopService`, `removeProcess`, `restartAll`, and `signalAll`. Actually
//! forking and waiting on a child is not this module's concern: a `Monitor`
//! is handed a `Launcher` closure that spawns the OS process and arranges,
//! by whatever means its caller prefers, to report the child's lifetime back
//! through [`Monitor::process_exited`]. That separation is what lets the
//! back-off and stagger scheduling be tested against a [`watchtower_clock::ManualClock`]
//! with no real process ever created.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use watchtower_common::error::WatchtowerError;
use watchtower_common::process::{ProcessRecord, ProcessSpec, ProcessState};
use watchtower_clock::{Clock, TimerHandle};

/// Spawns the OS process for a registered record and returns its pid. The
/// caller is responsible for detecting the child's exit and reporting it via
/// [`Monitor::process_exited`]; see `watchtower-orchestrator` for the
/// `tokio::process::Child`-backed implementation used in production.
pub type Launcher<S> = Arc<dyn Fn(&str, &ProcessRecord<S>) -> anyhow::Result<u32> + Send + Sync>;

/// Called after a child exits or is signaled, e.g. to tell the dispatcher
/// (C4) to stop routing connections to a worker that is going away.
pub type ExitHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Called right after a child is successfully spawned, e.g. to tell the
/// dispatcher (C4) that the corresponding worker socket may start routing
/// connections to it.
pub type StartHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct MonitorTiming {
    pub stagger_interval: Duration,
    pub kill_time: Duration,
    pub min_restart_delay: Duration,
    pub max_restart_delay: Duration,
    pub restart_threshold: Duration,
}

struct Slot<S: ProcessSpec> {
    record: ProcessRecord<S>,
    pid: Option<u32>,
    started_at: Option<Duration>,
    kill_timer: Option<Box<dyn TimerHandle>>,
    restart_timer: Option<Box<dyn TimerHandle>>,
}

struct State<S: ProcessSpec> {
    order: Vec<String>,
    slots: HashMap<String, Slot<S>>,
    running: bool,
    stopping: bool,
    pending_starts: u32,
    stop_waiters: Vec<tokio::sync::oneshot::Sender<()>>,
}

struct Inner<S: ProcessSpec> {
    clock: Arc<dyn Clock>,
    timing: MonitorTiming,
    launcher: Launcher<S>,
    on_start: Option<StartHook>,
    on_exit: Option<ExitHook>,
    state: Mutex<State<S>>,
}

/// Cheaply `Clone`-able handle over the shared monitor state; every public
/// method takes `&self` so a clone can be captured by timer callbacks and
/// background tasks.
pub struct Monitor<S: ProcessSpec> {
    inner: Arc<Inner<S>>,
}

impl<S: ProcessSpec> Clone for Monitor<S> {
    fn clone(&self) -> Self {
        Monitor {
            inner: self.inner.clone(),
        }
    }
}

fn empty_state<S: ProcessSpec>() -> State<S> {
    State {
        order: Vec::new(),
        slots: HashMap::new(),
        running: false,
        stopping: false,
        pending_starts: 0,
        stop_waiters: Vec::new(),
    }
}

impl<S: ProcessSpec + 'static> Monitor<S> {
    pub fn new(clock: Arc<dyn Clock>, timing: MonitorTiming, launcher: Launcher<S>) -> Self {
        Self::with_hooks(clock, timing, launcher, None, None)
    }

    pub fn with_exit_hook(
        clock: Arc<dyn Clock>,
        timing: MonitorTiming,
        launcher: Launcher<S>,
        on_exit: ExitHook,
    ) -> Self {
        Self::with_hooks(clock, timing, launcher, None, Some(on_exit))
    }

    /// Full constructor: `on_start` fires right after a successful spawn
    /// (e.g. to flip the dispatcher's worker socket to `Active`), `on_exit`
    /// fires after a reported exit (e.g. to flip it to `Stopped`).
    pub fn with_hooks(
        clock: Arc<dyn Clock>,
        timing: MonitorTiming,
        launcher: Launcher<S>,
        on_start: Option<StartHook>,
        on_exit: Option<ExitHook>,
    ) -> Self {
        Monitor {
            inner: Arc::new(Inner {
                clock,
                timing,
                launcher,
                on_start,
                on_exit,
                state: Mutex::new(empty_state()),
            }),
        }
    }

    /// Registers a new process under `name`. If the supervisor is already
    /// running, its staggered start begins immediately instead of waiting
    /// for a future `start_service` call.
    pub fn add(
        &self,
        name: impl Into<String>,
        spec: S,
        env: std::collections::BTreeMap<std::ffi::OsString, std::ffi::OsString>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<(), WatchtowerError> {
        let name = name.into();
        let running = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.inner.state.lock().unwrap();
            if state.slots.contains_key(&name) {
                return Err(WatchtowerError::DuplicateProcess(name));
            }
            let record = ProcessRecord::new(
                name.clone(),
                spec,
                env,
                uid,
                gid,
                self.inner.timing.min_restart_delay,
            );
            state.order.push(name.clone());
            state.slots.insert(
                name.clone(),
                Slot {
                    record,
                    pid: None,
                    started_at: None,
                    kill_timer: None,
                    restart_timer: None,
                },
            );
            state.running
        };
        if running {
            self.schedule_start(name);
        }
        Ok(())
    }

    /// Starts every registered process, staggered `stagger_interval` apart
    /// in registration order.
    pub fn start_service(&self) {
        let names = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.inner.state.lock().unwrap();
            state.running = true;
            state.order.clone()
        };
        for name in names {
            self.schedule_start(name);
        }
    }

    fn schedule_start(&self, name: String) {
        let delay = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.inner.state.lock().unwrap();
            state.pending_starts += 1;
            self.inner.timing.stagger_interval * (state.pending_starts - 1)
        };
        let monitor = self.clone();
        self.inner.clock.after(
            delay,
            Box::new(move || {
                {
                    #[allow(clippy::unwrap_used)]
                    let mut state = monitor.inner.state.lock().unwrap();
                    state.pending_starts = state.pending_starts.saturating_sub(1);
                }
                monitor.really_start(&name);
            }),
        );
    }

    fn really_start(&self, name: &str) {
        let now = self.inner.clock.now();
        let spawned = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.inner.state.lock().unwrap();
            let Some(slot) = state.slots.get_mut(name) else {
                return;
            };
            slot.record.state = ProcessState::Starting;
            slot.started_at = Some(now);
            slot.record.spec.on_starting();
            (self.inner.launcher)(name, &slot.record)
        };
        match spawned {
            Ok(pid) => {
                {
                    #[allow(clippy::unwrap_used)]
                    let mut state = self.inner.state.lock().unwrap();
                    if let Some(slot) = state.slots.get_mut(name) {
                        slot.pid = Some(pid);
                        slot.record.state = ProcessState::Running;
                    }
                }
                if let Some(hook) = &self.inner.on_start {
                    hook(name);
                }
            }
            Err(err) => {
                tracing::warn!(process = name, error = %err, "failed to spawn process");
                self.process_exited(name, Duration::ZERO);
            }
        }
    }

    /// Reports that the process registered under `name` has exited after
    /// having run for `lifetime`. Schedules a restart (immediately, if it
    /// had been alive at least `restart_threshold`; after an exponentially
    /// growing back-off otherwise) unless the monitor is stopping or the
    /// process has been removed.
    pub fn process_exited(&self, name: &str, lifetime: Duration) {
        let timing = self.inner.timing;
        let (should_restart, delay, stopping_and_idle) = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.inner.state.lock().unwrap();
            let Some(slot) = state.slots.get_mut(name) else {
                return;
            };
            if let Some(handle) = slot.kill_timer.take() {
                handle.cancel();
            }
            slot.pid = None;
            slot.started_at = None;
            slot.record.state = ProcessState::Stopped;
            slot.record.spec.on_stopped();

            let delay = if lifetime >= timing.restart_threshold {
                slot.record.current_delay = timing.min_restart_delay;
                Duration::ZERO
            } else {
                let delay = slot.record.current_delay;
                slot.record.current_delay =
                    std::cmp::min(delay * 2, timing.max_restart_delay);
                delay
            };

            let running = state.running && !state.stopping;
            let idle = state.stopping && !state.slots.values().any(|s| matches!(s.record.state, ProcessState::Starting | ProcessState::Running | ProcessState::Stopping));
            (running, delay, idle)
        };

        if let Some(hook) = &self.inner.on_exit {
            hook(name);
        }

        if should_restart {
            let monitor = self.clone();
            let callback_name = name.to_string();
            let handle = self.inner.clock.after(
                delay,
                Box::new(move || {
                    monitor.really_start(&callback_name);
                }),
            );
            #[allow(clippy::unwrap_used)]
            let mut state = self.inner.state.lock().unwrap();
            if let Some(slot) = state.slots.get_mut(name) {
                slot.restart_timer = Some(handle);
            }
        } else if stopping_and_idle {
            self.wake_stop_waiters();
        }
    }

    /// Sends SIGTERM to the named process and arms a SIGKILL escalation
    /// timer for `kill_time` later. A no-op if the process is unknown or
    /// already stopped.
    pub fn stop(&self, name: &str) {
        let pid = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.inner.state.lock().unwrap();
            let Some(slot) = state.slots.get_mut(name) else {
                return;
            };
            if let Some(handle) = slot.restart_timer.take() {
                handle.cancel();
            }
            let Some(pid) = slot.pid else { return };
            slot.record.state = ProcessState::Stopping;
            pid
        };

        if let Err(err) = watchtower_spawn::signal::terminate(pid) {
            tracing::warn!(process = name, error = %err, "failed to send SIGTERM");
        }

        let monitor = self.clone();
        let callback_name = name.to_string();
        let handle = self.inner.clock.after(
            self.inner.timing.kill_time,
            Box::new(move || {
                if let Some(pid) = monitor.pid_of(&callback_name) {
                    let _ = watchtower_spawn::signal::kill(pid);
                }
            }),
        );
        #[allow(clippy::unwrap_used)]
        let mut state = self.inner.state.lock().unwrap();
        if let Some(slot) = state.slots.get_mut(name) {
            slot.kill_timer = Some(handle);
        }
    }

    fn pid_of(&self, name: &str) -> Option<u32> {
        #[allow(clippy::unwrap_used)]
        let state = self.inner.state.lock().unwrap();
        state.slots.get(name).and_then(|s| s.pid)
    }

    /// Stops every process in reverse registration order and returns a
    /// future that resolves once all of them have been reported exited.
    pub async fn stop_service(&self) {
        let (names, already_idle, rx) = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.inner.state.lock().unwrap();
            state.running = false;
            state.stopping = true;
            for slot in state.slots.values_mut() {
                if matches!(slot.record.state, ProcessState::NotStarted | ProcessState::Stopped) {
                    if let Some(handle) = slot.restart_timer.take() {
                        handle.cancel();
                    }
                }
            }
            let idle = !state.slots.values().any(|s| matches!(s.record.state, ProcessState::Starting | ProcessState::Running | ProcessState::Stopping));
            let (tx, rx) = tokio::sync::oneshot::channel();
            if !idle {
                state.stop_waiters.push(tx);
            }
            let mut names = state.order.clone();
            names.reverse();
            (names, idle, rx)
        };

        for name in names {
            self.stop(&name);
        }

        if !already_idle {
            let _ = rx.await;
        }
    }

    fn wake_stop_waiters(&self) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.inner.state.lock().unwrap();
        for tx in state.stop_waiters.drain(..) {
            let _ = tx.send(());
        }
    }

    /// Removes a process from supervision. If it is currently running it is
    /// first asked to stop; once it exits it will not be restarted since it
    /// no longer has a slot to look up.
    pub fn remove(&self, name: &str) {
        self.stop(name);
        #[allow(clippy::unwrap_used)]
        let mut state = self.inner.state.lock().unwrap();
        state.slots.remove(name);
        state.order.retain(|n| n != name);
    }

    /// Stops and lets the normal exit path restart every currently running
    /// process.
    pub fn restart_all(&self) {
        let names = {
            #[allow(clippy::unwrap_used)]
            let state = self.inner.state.lock().unwrap();
            state.order.clone()
        };
        for name in names {
            self.stop(&name);
        }
    }

    /// Sends `sig` to every process currently running (optionally filtered
    /// to names starting with `prefix`).
    pub fn signal_all(&self, sig: nix::sys::signal::Signal, prefix: Option<&str>) {
        #[allow(clippy::unwrap_used)]
        let state = self.inner.state.lock().unwrap();
        for name in &state.order {
            if let Some(prefix) = prefix {
                if !name.starts_with(prefix) {
                    continue;
                }
            }
            if let Some(pid) = state.slots.get(name).and_then(|s| s.pid) {
                let _ = watchtower_spawn::signal::send_signal(pid, sig);
            }
        }
    }

    /// Current supervision state of one process, for status reporting.
    pub fn state_of(&self, name: &str) -> Option<ProcessState> {
        #[allow(clippy::unwrap_used)]
        let state = self.inner.state.lock().unwrap();
        state.slots.get(name).map(|s| s.record.state)
    }

    /// Name and pid of every currently-running child, for the memory-limit
    /// enforcer (C6) to poll.
    pub fn running_pids(&self) -> Vec<(String, u32)> {
        #[allow(clippy::unwrap_used)]
        let state = self.inner.state.lock().unwrap();
        state
            .order
            .iter()
            .filter_map(|name| {
                let slot = state.slots.get(name)?;
                slot.pid.map(|pid| (name.clone(), pid))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use watchtower_clock::ManualClock;

    struct NoopSpec;
    impl ProcessSpec for NoopSpec {
        fn command_line(&self) -> Vec<std::ffi::OsString> {
            Vec::new()
        }
    }

    fn timing() -> MonitorTiming {
        MonitorTiming {
            stagger_interval: Duration::from_millis(500),
            kill_time: Duration::from_millis(200),
            min_restart_delay: Duration::from_secs(1),
            max_restart_delay: Duration::from_secs(8),
            restart_threshold: Duration::from_secs(1),
        }
    }

    fn counting_launcher() -> (Launcher<NoopSpec>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let launcher: Launcher<NoopSpec> = Arc::new(move |_name, _record| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(1234)
        });
        (launcher, calls)
    }

    #[test]
    fn restart_backoff_doubles_up_to_the_cap() {
        let clock = Arc::new(ManualClock::new());
        let (launcher, calls) = counting_launcher();
        let monitor: Monitor<NoopSpec> =
            Monitor::new(clock.clone(), timing(), launcher);
        monitor
            .add("a", NoopSpec, BTreeMap::new(), None, None)
            .unwrap();
        monitor.start_service();
        clock.advance(Duration::ZERO);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Each exit happens well inside `restart_threshold`, so the delay
        // doubles: 1, 2, 4, 8, 8 (capped at max_restart_delay).
        for expected_calls in [2u32, 3, 4, 5, 6] {
            monitor.process_exited("a", Duration::from_millis(100));
            clock.advance(Duration::from_secs(8));
            assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
        }
    }

    #[test]
    fn long_lived_exit_resets_the_backoff() {
        let clock = Arc::new(ManualClock::new());
        let (launcher, calls) = counting_launcher();
        let monitor: Monitor<NoopSpec> =
            Monitor::new(clock.clone(), timing(), launcher);
        monitor
            .add("a", NoopSpec, BTreeMap::new(), None, None)
            .unwrap();
        monitor.start_service();
        clock.advance(Duration::ZERO);

        monitor.process_exited("a", Duration::from_millis(100));
        clock.advance(Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // This exit is long-lived (>= restart_threshold), so the restart is
        // immediate and the back-off resets to min_restart_delay.
        monitor.process_exited("a", Duration::from_secs(2));
        clock.advance(Duration::ZERO);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        monitor.process_exited("a", Duration::from_millis(100));
        clock.advance(Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn start_service_staggers_registration_order() {
        let clock = Arc::new(ManualClock::new());
        let (launcher, calls) = counting_launcher();
        let monitor: Monitor<NoopSpec> =
            Monitor::new(clock.clone(), timing(), launcher);
        for name in ["a", "b", "c"] {
            monitor
                .add(name, NoopSpec, BTreeMap::new(), None, None)
                .unwrap();
        }
        monitor.start_service();

        clock.advance(Duration::ZERO);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        clock.advance(Duration::from_millis(499));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        clock.advance(Duration::from_millis(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        clock.advance(Duration::from_millis(500));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let clock = Arc::new(ManualClock::new());
        let (launcher, _calls) = counting_launcher();
        let monitor: Monitor<NoopSpec> =
            Monitor::new(clock, timing(), launcher);
        monitor
            .add("a", NoopSpec, BTreeMap::new(), None, None)
            .unwrap();
        let err = monitor
            .add("a", NoopSpec, BTreeMap::new(), None, None)
            .unwrap_err();
        assert!(matches!(err, WatchtowerError::DuplicateProcess(_)));
    }

    #[test]
    fn on_start_hook_fires_after_a_successful_spawn() {
        let clock = Arc::new(ManualClock::new());
        let (launcher, _calls) = counting_launcher();
        let started = Arc::new(Mutex::new(Vec::new()));
        let s = started.clone();
        let on_start: StartHook = Arc::new(move |name| {
            #[allow(clippy::unwrap_used)]
            s.lock().unwrap().push(name.to_string());
        });
        let monitor: Monitor<NoopSpec> =
            Monitor::with_hooks(clock.clone(), timing(), launcher, Some(on_start), None);
        monitor
            .add("a", NoopSpec, BTreeMap::new(), None, None)
            .unwrap();
        monitor.start_service();
        clock.advance(Duration::ZERO);
        #[allow(clippy::unwrap_used)]
        assert_eq!(*started.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn stop_service_stops_in_reverse_order_and_resolves_once_idle() {
        let clock = Arc::new(ManualClock::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        let launcher: Launcher<NoopSpec> = Arc::new(move |_name, _record| Ok(1));
        let monitor: Monitor<NoopSpec> = Monitor::new(clock.clone(), timing(), launcher);
        for name in ["a", "b", "c"] {
            monitor
                .add(name, NoopSpec, BTreeMap::new(), None, None)
                .unwrap();
        }
        monitor.start_service();
        clock.advance(Duration::from_secs(2));

        // Stop is issued in reverse order; the monitor records it via the
        // pid each process was assigned, not via a real signal delivery
        // (there is no real process here), so we just assert on state.
        let monitor2 = monitor.clone();
        let stop_fut = tokio::spawn(async move {
            monitor2.stop_service().await;
        });

        // Let `stop_service` run far enough to call `stop()` on all three.
        tokio::task::yield_now().await;
        assert_eq!(monitor.state_of("a"), Some(ProcessState::Stopping));
        assert_eq!(monitor.state_of("c"), Some(ProcessState::Stopping));

        // Simulate each process reporting its exit, as a real reaper would.
        for name in ["c", "b", "a"] {
            monitor.process_exited(name, Duration::from_secs(5));
        }
        stop_fut.await.unwrap();
        let _ = o;
    }
}
