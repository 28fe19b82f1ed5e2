// SPDX-License-Identifier: Apache-2.0

//! The master orchestrator (component C9): selects a run mode from
//! configuration and wires the clock, control channel, FD-passing
//! dispatcher, process monitor, memory enforcer, and slave-spawner service
//! together.
//!
//! The actual CalDAV/CardDAV request handling, storage engine, and TLS
//! context construction are external collaborators (out of scope); this
//! module accepts them as a resolved [`ConfigSnapshot`] plus a handful of
//! caller-supplied factories and hooks.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UnixListener};

use watchtower_clock::{Clock, TokioClock};
use watchtower_common::process::{ProcessRecord, ProcessSpec, StaticArgvSpec};
use watchtower_common::ConfigSnapshot;
use watchtower_ipc::channel::routes::log::log_route;
use watchtower_ipc::channel::routes::queue::{queue_route, QueueState};
use watchtower_ipc::channel::{ControlChannel, ControlChannelBuilder};
use watchtower_ipc::dispatch::{worker_recv_connection, worker_send_ack, Dispatcher, ListenerTag};
use watchtower_spawn::builder::{SpawnBuilder, Stdio};
use watchtower_spawn::slave::{ConnectionMode, SlaveSpawnerService, WorkerIdentity, META_FD_SLOT};
use watchtower_supervisor::memory::{MemoryEnforcer, MemoryLimitConfig, PidLister};
use watchtower_supervisor::monitor::{ExitHook, Launcher, Monitor, MonitorTiming, StartHook};

use crate::sighup::{reexec_self, watch_sighup};
use crate::stale_socket::clean_stale_sockets;

/// One-shot closure a `Utility`/`Agent` run performs before exiting.
pub type UtilityTask = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Worker-side callback invoked for each connection handed over by the
/// dispatcher: the accepted socket and the listener tag byte (`T`/`S`).
pub type ConnectionHandler = Arc<dyn Fn(OwnedFd, u8) + Send + Sync>;

fn monitor_timing(config: &ConfigSnapshot) -> MonitorTiming {
    MonitorTiming {
        stagger_interval: config.stagger_interval,
        kill_time: config.kill_time,
        min_restart_delay: config.min_restart_delay,
        max_restart_delay: config.max_restart_delay,
        restart_threshold: config.restart_threshold,
    }
}

fn listener_probe_ports(config: &ConfigSnapshot) -> Vec<u16> {
    config.listeners.iter().map(|l| l.address.port()).collect()
}

/// Binds the control channel's Unix-domain socket and secures it: group
/// ownership set to `gid` (if configured) and mode 0660, both applied
/// immediately after bind so the file is never briefly world-accessible.
fn bind_unix_control_listener(path: &Path, gid: Option<u32>) -> anyhow::Result<UnixListener> {
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
    if let Err(err) = nix::unistd::chown(path, None, gid.map(nix::unistd::Gid::from_raw)) {
        anyhow::bail!("failed to chown control socket {}: {err}", path.display());
    }
    Ok(listener)
}

/// Duplicates a raw master-side fd (the value in a [`ProcessSpec::extra_fds`]
/// mapping) into a fresh, independently-owned descriptor, so the spawn call
/// can install it in the child without consuming the master's own copy.
fn dup_raw_fd(fd: RawFd) -> anyhow::Result<OwnedFd> {
    // SAFETY: `dup` returns either a fresh, independently-owned descriptor
    // or -1 on error, checked below.
    let duped = unsafe { libc::dup(fd) };
    if duped < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: `duped` was just returned by `dup` above and is not used
    // anywhere else.
    Ok(unsafe { OwnedFd::from_raw_fd(duped) })
}

/// Registered under one worker's name in the `Combined`-mode monitor. Its
/// `command_line` is deliberately empty: the worker's real argv depends on
/// a late-bound, per-spawn meta-FD duplicate, which only the launcher
/// closure (built in [`CombinedOrchestrator::build`]) can produce, so it
/// calls `SlaveSpawnerService::spawn` directly instead of going through
/// this trait method.
struct WorkerSpec {
    identity: WorkerIdentity,
    slot_id: u32,
}

impl ProcessSpec for WorkerSpec {
    fn command_line(&self) -> Vec<OsString> {
        Vec::new()
    }
}

/// Reads `reader` to EOF, segmenting it into lines through a [`watchtower_log::LineRelay`]
/// tagged `source`, and emits each completed record through `tracing` under
/// `process`. One task per stream, matching C2's "strictly sequential"
/// per-child-per-stream delivery order.
fn spawn_log_relay(
    process: String,
    source: &'static str,
    mut reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) {
    tokio::spawn(async move {
        let mut relay = watchtower_log::LineRelay::new(source);
        let mut buf = [0u8; 4096];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(process = %process, error = %err, "log relay read failed");
                    break;
                }
            };
            for record in relay.feed(&buf[..n]) {
                tracing::info!(process = %process, source = %record.source, "{}", String::from_utf8_lossy(&record.line));
            }
        }
    });
}

fn spawn_exit_reporter(
    name: String,
    started: Duration,
    clock: Arc<dyn Clock>,
    monitor_cell: Arc<OnceLock<Monitor<WorkerSpec>>>,
    mut child: tokio::process::Child,
) {
    tokio::spawn(async move {
        if let Err(err) = child.wait().await {
            tracing::warn!(process = %name, error = %err, "failed to wait on worker child");
        }
        let lifetime = clock.now().saturating_sub(started);
        if let Some(monitor) = monitor_cell.get() {
            monitor.process_exited(&name, lifetime);
        }
    });
}

fn worker_launcher(
    clock: Arc<dyn Clock>,
    dispatcher: Arc<Dispatcher>,
    spawner: Arc<SlaveSpawnerService>,
    monitor_cell: Arc<OnceLock<Monitor<WorkerSpec>>>,
) -> Launcher<WorkerSpec> {
    Arc::new(move |name, record: &ProcessRecord<WorkerSpec>| {
        let fd = dispatcher.dup_child_end(record.spec.slot_id)?;
        let mode = ConnectionMode::MetaFd(fd);
        let mut spawned = spawner.spawn(
            &record.spec.identity,
            mode,
            record.uid,
            record.gid,
            record.env.clone(),
        )?;
        let pid = spawned.pid;
        if let Some(stdout) = spawned.child.stdout.take() {
            spawn_log_relay(name.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = spawned.child.stderr.take() {
            spawn_log_relay(name.to_string(), "stderr", stderr);
        }
        spawn_exit_reporter(
            name.to_string(),
            clock.now(),
            clock.clone(),
            monitor_cell.clone(),
            spawned.child,
        );
        Ok(pid)
    })
}

/// Wires together the listeners, dispatcher, control channel, worker
/// monitor, and memory enforcer for `ProcessType::Combined`.
pub struct CombinedOrchestrator {
    pub clock: Arc<dyn Clock>,
    pub dispatcher: Arc<Dispatcher>,
    pub monitor: Monitor<WorkerSpec>,
    pub control_channel: ControlChannel,
    pub queue_state: Arc<Mutex<QueueState>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl CombinedOrchestrator {
    pub async fn build(
        config: &ConfigSnapshot,
        spawner: SlaveSpawnerService,
        access_log_path: &Path,
        tls_available: bool,
    ) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());

        let control_socket_paths: Vec<PathBuf> = config.control_socket_path.iter().cloned().collect();
        clean_stale_sockets(&control_socket_paths, &listener_probe_ports(config))?;

        let mut dispatcher = Dispatcher::new(config.max_accepts, config.max_requests);
        let mut listener_ids = Vec::new();
        for listener in &config.listeners {
            let tag = if listener.tls { ListenerTag::Ssl } else { ListenerTag::Tcp };
            if listener.tls && !tls_available {
                tracing::warn!(
                    address = %listener.address,
                    "no TLS context available, skipping SSL listener"
                );
                continue;
            }
            match dispatcher.add_listener(listener.address, listener.backlog, tag).await {
                Ok(id) => listener_ids.push(id),
                Err(err) => {
                    tracing::warn!(address = %listener.address, error = %err, "failed to open listener");
                }
            }
        }

        let bind_addresses: Vec<std::net::SocketAddr> =
            config.listeners.iter().map(|l| l.address).collect();

        let mut slot_by_name = HashMap::new();
        for slot_id in 0..config.worker_count {
            dispatcher.add_socket(slot_id)?;
            slot_by_name.insert(format!("worker-{slot_id}"), slot_id);
        }
        let dispatcher = Arc::new(dispatcher);
        let slot_by_name = Arc::new(slot_by_name);
        let spawner = Arc::new(spawner);
        let monitor_cell: Arc<OnceLock<Monitor<WorkerSpec>>> = Arc::new(OnceLock::new());

        let launcher = worker_launcher(
            clock.clone(),
            dispatcher.clone(),
            spawner.clone(),
            monitor_cell.clone(),
        );

        let on_start: StartHook = {
            let dispatcher = dispatcher.clone();
            let slot_by_name = slot_by_name.clone();
            Arc::new(move |name: &str| {
                if let Some(&slot_id) = slot_by_name.get(name) {
                    dispatcher.start(slot_id);
                }
            })
        };
        let on_exit: ExitHook = {
            let dispatcher = dispatcher.clone();
            let slot_by_name = slot_by_name.clone();
            Arc::new(move |name: &str| {
                if let Some(&slot_id) = slot_by_name.get(name) {
                    dispatcher.stop(slot_id);
                }
            })
        };

        let monitor: Monitor<WorkerSpec> = Monitor::with_hooks(
            clock.clone(),
            monitor_timing(config),
            launcher,
            Some(on_start),
            Some(on_exit),
        );
        // Infallible: this is the only place that ever calls `set`, and it
        // runs once, before any worker can possibly have exited yet.
        let _ = monitor_cell.set(monitor.clone());

        for slot_id in 0..config.worker_count {
            let identity = WorkerIdentity {
                log_id: slot_id,
                bind_addresses: bind_addresses.clone(),
            };
            monitor.add(
                format!("worker-{slot_id}"),
                WorkerSpec { identity, slot_id },
                BTreeMap::new(),
                config.uid,
                config.gid,
            )?;
        }
        monitor.start_service();

        let access_log_file = Arc::new(Mutex::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(access_log_path)?,
        ));
        let queue_state = Arc::new(Mutex::new(QueueState::default()));
        let control_channel = ControlChannelBuilder::new()
            .with_route(log_route(access_log_file))
            .with_route(queue_route(queue_state.clone()))
            .build();

        let mut tasks = Vec::new();

        // A Unix-domain control socket takes priority over the loopback TCP
        // port when configured, matching the "Unix socket when
        // control_socket_path is set, else loopback TCP" channel-transport
        // design note.
        if let Some(path) = &config.control_socket_path {
            let control_listener = bind_unix_control_listener(path, config.gid)?;
            let control_channel = control_channel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match control_listener.accept().await {
                        Ok((stream, _addr)) => {
                            let control_channel = control_channel.clone();
                            tokio::spawn(async move {
                                if let Err(err) = control_channel.serve_connection(stream).await {
                                    tracing::debug!(error = %err, "control channel connection ended");
                                }
                            });
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "control channel accept failed, stopping listener");
                            break;
                        }
                    }
                }
            }));
        } else {
            let control_listener = TcpListener::bind(("0.0.0.0", config.control_port)).await?;
            let control_channel = control_channel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match control_listener.accept().await {
                        Ok((stream, _addr)) => {
                            let control_channel = control_channel.clone();
                            tokio::spawn(async move {
                                if let Err(err) = control_channel.serve_connection(stream).await {
                                    tracing::debug!(error = %err, "control channel connection ended");
                                }
                            });
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "control channel accept failed, stopping listener");
                            break;
                        }
                    }
                }
            }));
        }

        for listener_id in listener_ids {
            let dispatcher = dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    // `max_accepts` bounds how many connections this
                    // listener admits per polling tick; once the tick's
                    // batch is exhausted, yield back to the runtime (and
                    // let the ack poller run) before starting the next
                    // tick, rather than accepting forever in one
                    // uninterrupted loop iteration.
                    let mut accepted_this_tick = 0usize;
                    while accepted_this_tick < dispatcher.max_accepts() {
                        match dispatcher.accept_and_dispatch(listener_id).await {
                            Ok(Some(_slot_id)) => {
                                accepted_this_tick += 1;
                            }
                            Ok(None) => {
                                // No worker is currently eligible; back off
                                // briefly rather than spinning on `accept`.
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                break;
                            }
                            Err(err) => {
                                tracing::warn!(listener_id, error = %err, "accept/dispatch failed");
                                break;
                            }
                        }
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        {
            let dispatcher = dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if let Err(err) = dispatcher.poll_acks().await {
                        tracing::warn!(error = %err, "dispatch acknowledgement poll failed");
                    }
                }
            }));
        }

        if let Some(limit_bytes) = config.memory_limit_bytes {
            let monitor_for_pids = monitor.clone();
            let pids: PidLister = Arc::new(move || monitor_for_pids.running_pids());
            let mem_config = MemoryLimitConfig {
                limit_bytes,
                resident_only: config.memory_limit_resident_only,
                period: config.memory_limit_period,
            };
            let enforcer = Arc::new(MemoryEnforcer::new(clock.clone(), mem_config, pids));
            enforcer.start();
        }

        let sighup_argv: Vec<OsString> = std::env::args_os().collect();
        tasks.push(watch_sighup(move || {
            if let Err(err) = reexec_self(&sighup_argv) {
                tracing::error!(error = %err, "SIGHUP re-exec failed");
            }
        }));

        Ok(CombinedOrchestrator {
            clock,
            dispatcher,
            monitor,
            control_channel,
            queue_state,
            tasks,
        })
    }

    /// Stops every worker (reverse order, SIGTERM/SIGKILL escalation) and
    /// tears down the background accept/poll/control tasks.
    pub async fn shutdown(self) {
        self.monitor.stop_service().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Runs `ProcessType::Single`: no subprocess dispatch, just the in-process
/// request service (an external collaborator, out of scope here) plus any
/// registered helper daemons supervised the same way `Combined` supervises
/// workers.
pub async fn run_single(
    config: &ConfigSnapshot,
    helper_daemons: Vec<(String, StaticArgvSpec)>,
) -> anyhow::Result<Monitor<StaticArgvSpec>> {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let monitor_cell: Arc<OnceLock<Monitor<StaticArgvSpec>>> = Arc::new(OnceLock::new());

    let launcher: Launcher<StaticArgvSpec> = {
        let clock = clock.clone();
        let monitor_cell = monitor_cell.clone();
        Arc::new(move |name, record: &ProcessRecord<StaticArgvSpec>| {
            let argv = record.spec.command_line();
            let Some((program, rest)) = argv.split_first() else {
                anyhow::bail!("helper daemon `{name}` has an empty command line");
            };
            let mut builder = SpawnBuilder::new(program.clone())
                .args(rest.to_vec())
                .envs(watchtower_common::env::inherited_env())
                .envs(record.env.clone())
                .stdout(Stdio::Piped)
                .stderr(Stdio::Piped);
            if let Some(uid) = record.uid {
                builder = builder.uid(uid);
            }
            if let Some(gid) = record.gid {
                builder = builder.gid(gid);
            }
            for (child_fd, master_fd) in record.spec.extra_fds() {
                builder = builder.pass_fd(child_fd, dup_raw_fd(master_fd)?);
            }
            let mut spawned = builder.spawn()?;
            let pid = spawned.pid;
            if let Some(stdout) = spawned.child.stdout.take() {
                spawn_log_relay(name.to_string(), "stdout", stdout);
            }
            if let Some(stderr) = spawned.child.stderr.take() {
                spawn_log_relay(name.to_string(), "stderr", stderr);
            }
            spawn_exit_reporter_static(
                name.to_string(),
                clock.now(),
                clock.clone(),
                monitor_cell.clone(),
                spawned.child,
            );
            Ok(pid)
        })
    };

    let monitor: Monitor<StaticArgvSpec> = Monitor::new(clock, monitor_timing(config), launcher);
    let _ = monitor_cell.set(monitor.clone());

    for (name, spec) in helper_daemons {
        monitor.add(name, spec, BTreeMap::new(), config.uid, config.gid)?;
    }
    monitor.start_service();
    Ok(monitor)
}

fn spawn_exit_reporter_static(
    name: String,
    started: Duration,
    clock: Arc<dyn Clock>,
    monitor_cell: Arc<OnceLock<Monitor<StaticArgvSpec>>>,
    mut child: tokio::process::Child,
) {
    tokio::spawn(async move {
        if let Err(err) = child.wait().await {
            tracing::warn!(process = %name, error = %err, "failed to wait on helper daemon");
        }
        let lifetime = clock.now().saturating_sub(started);
        if let Some(monitor) = monitor_cell.get() {
            monitor.process_exited(&name, lifetime);
        }
    });
}

/// Runs `ProcessType::Utility` or `ProcessType::Agent`: a one-shot task
/// with a store handle (an external collaborator) that never opens any
/// listener and exits as soon as `task` returns.
pub async fn run_utility_or_agent(task: UtilityTask) -> anyhow::Result<()> {
    task()
}

/// Runs `ProcessType::Slave`: the same binary, re-invoked by the master's
/// slave-spawner service with its dispatcher datagram socket installed at
/// [`META_FD_SLOT`]. Blocks in a dedicated thread since `recvmsg` on the
/// meta-FD has no async counterpart in this workspace's stack;
/// `on_connection` dispatches the accepted socket to the request service.
pub async fn run_slave(on_connection: ConnectionHandler) -> anyhow::Result<()> {
    // SAFETY: the parent installs the dispatcher socket at `META_FD_SLOT`
    // before exec via `SpawnBuilder::pass_fd`, and it stays open for the
    // life of this process.
    let socket = unsafe { std::os::unix::net::UnixDatagram::from_raw_fd(META_FD_SLOT) };
    let handle = tokio::task::spawn_blocking(move || loop {
        match worker_recv_connection(&socket) {
            Ok((tag, fd)) => {
                on_connection(fd, tag);
                if let Err(err) = worker_send_ack(&socket, true) {
                    tracing::warn!(error = %err, "failed to send dispatch acknowledgement");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "meta-FD socket closed, stopping receive loop");
                break;
            }
        }
    });
    handle.await?;
    Ok(())
}

/// Runs `ProcessType::Slave` on a platform (or configuration) where FD
/// passing over the meta-FD is unavailable: the master already bound
/// `plain_fds`/`ssl_fds` as listening sockets and passed them through
/// `fork()`/`exec()` inheritance instead, per the `-o InheritFDs=` /
/// `-o InheritSSLFDs=` argv shape `SlaveSpawnerService::build_argv` emits
/// for [`watchtower_spawn::slave::ConnectionMode::InheritFds`]. Each fd is
/// `accept()`-ed directly in its own task; there is no dispatcher
/// admission control here since the worker owns the listener itself,
/// matching the classic pre-fork accept model this is a fallback for.
pub async fn run_slave_inherited_fds(
    plain_fds: Vec<RawFd>,
    ssl_fds: Vec<RawFd>,
    on_connection: ConnectionHandler,
) -> anyhow::Result<()> {
    let mut tasks = Vec::new();
    for fd in plain_fds {
        tasks.push(spawn_inherited_accept_loop(fd, ListenerTag::Tcp.wire_byte(), on_connection.clone())?);
    }
    for fd in ssl_fds {
        tasks.push(spawn_inherited_accept_loop(fd, ListenerTag::Ssl.wire_byte(), on_connection.clone())?);
    }
    for task in tasks {
        task.await?;
    }
    Ok(())
}

fn spawn_inherited_accept_loop(
    fd: RawFd,
    tag: u8,
    on_connection: ConnectionHandler,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    // SAFETY: the master duplicated this listening socket across `exec()`
    // for exactly this worker to inherit, per `ConnectionMode::InheritFds`.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;
    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => match stream.into_std() {
                    Ok(std_stream) => on_connection(OwnedFd::from(std_stream), tag),
                    Err(err) => tracing::warn!(fd, error = %err, "failed to detach accepted stream"),
                },
                Err(err) => {
                    tracing::warn!(fd, error = %err, "inherited-fd accept failed, stopping loop");
                    break;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn unix_control_listener_is_mode_0660() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let _listener = bind_unix_control_listener(&path, None).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
    }

    #[test]
    fn dup_raw_fd_yields_an_independent_descriptor_over_the_same_file() {
        let (mut reader, writer) = nix::unistd::pipe()
            .map(|(r, w)| {
                (
                    std::fs::File::from(r),
                    std::fs::File::from(w),
                )
            })
            .unwrap();
        let duped = dup_raw_fd(writer.as_raw_fd()).unwrap();
        assert_ne!(duped.as_raw_fd(), writer.as_raw_fd());

        use std::io::Write;
        let mut duped_file = std::fs::File::from(duped);
        duped_file.write_all(b"hi").unwrap();
        drop(duped_file);
        drop(writer);

        use std::io::Read;
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn run_single_passes_extra_fds_into_the_spawned_helper() {
        use std::os::fd::IntoRawFd;
        let (reader, writer) = nix::unistd::pipe()
            .map(|(r, w)| (r.into_raw_fd(), w.into_raw_fd()))
            .unwrap();

        // Keep the raw fds alive for the duration of the spawn call; the
        // launcher dup()s them rather than consuming the originals.
        let _reader_file = unsafe { std::fs::File::from_raw_fd(reader) };
        let writer_file = unsafe { std::fs::File::from_raw_fd(writer) };

        // Child fd 9 receives a dup of our writer end; it writes "ok" to
        // it and exits, which we observe on our retained reader end.
        let spec = StaticArgvSpec::new(["/bin/sh", "-c", "printf ok >&9"]).with_extra_fd(9, writer);

        let monitor = run_single(&ConfigSnapshot::default(), vec![("helper".to_string(), spec)])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(writer_file);

        let mut buf = Vec::new();
        use std::io::Read;
        unsafe { std::fs::File::from_raw_fd(reader) }
            .read_to_end(&mut buf)
            .unwrap();
        assert_eq!(buf, b"ok");

        monitor.stop_service().await;
    }

    #[tokio::test]
    async fn run_slave_inherited_fds_accepts_and_tags_connections() {
        use std::io::Write;
        use std::os::fd::IntoRawFd;
        use std::sync::atomic::{AtomicU8, Ordering};

        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let addr = std_listener.local_addr().unwrap();
        let fd = std_listener.into_raw_fd();

        let received_tag = Arc::new(AtomicU8::new(0));
        let received = received_tag.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let on_connection: ConnectionHandler = Arc::new(move |_fd, tag| {
            received.store(tag, Ordering::SeqCst);
            let _ = tx.send(());
        });

        let task = tokio::spawn(run_slave_inherited_fds(vec![fd], Vec::new(), on_connection));

        // Give the accept loop a moment to start before connecting.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .await
            .unwrap();
        assert_eq!(received_tag.load(Ordering::SeqCst), ListenerTag::Tcp.wire_byte());

        task.abort();
    }
}
