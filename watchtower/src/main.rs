// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Process entry point. Resolves the CLI surface and its `-o key=value`
//! configuration overlay, initializes tracing, builds the blocking-task
//! runtime, and dispatches to the run mode named by the resolved
//! `ProcessType`.
//!
//! Adapted from `datadog-sidecar`'s `ddog_daemon_entry_point` daemon
//! bootstrap shape (tracing init, then daemonize/wire, then run), changed
//! from an `extern "C"` FFI entry point to a plain `fn main()` since this
//! binary is not embedded in a host process.
//!
//! Config-file parsing, the HTTP request handlers, the storage engine, and
//! TLS context construction are external collaborators out of scope for
//! this workspace (see the crate-level docs); this entry point wires the
//! minimal stand-ins a standalone binary can provide without them.

mod pid_file;
mod worker_identity;

use std::process::ExitCode;

use clap::Parser;

use watchtower_common::process::ProcessType;
use watchtower_common::ConfigSnapshot;
use watchtower_orchestrator::cli::{apply_overrides, parse_override, resolve_group, resolve_user, CliArgs};
use watchtower_orchestrator::{
    run_single, run_slave, run_slave_inherited_fds, run_utility_or_agent, CombinedOrchestrator,
};
use watchtower_spawn::slave::SlaveSpawnerService;

use worker_identity::WorkerArgs;

fn main() -> ExitCode {
    watchtower_log::init_tracing();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let overrides = args
        .option
        .iter()
        .map(|raw| parse_override(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let worker_args = WorkerArgs::from_overrides(&overrides)?;

    let mut config = apply_overrides(ConfigSnapshot::from_env(), &overrides)?;
    if let Some(user) = &args.user {
        config.uid = Some(resolve_user(user)?);
    }
    if let Some(group) = &args.group {
        config.gid = Some(resolve_group(group)?);
    }

    // The blocking-task pool backing `tokio::task::spawn_blocking` (used by
    // the access-log route's disk writes, see `watchtower_ipc::channel::routes::log`)
    // lives on this runtime. It must exist before anything below can submit
    // work to it, so building the runtime is the first thing this function
    // does once the configuration overlay is resolved -- ahead of any
    // listener, dispatcher, or monitor construction -- per the
    // reactor/thread-pool bootstrap-ordering design note.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(32)
        .build()?;

    runtime.block_on(dispatch(config, args.config.unwrap_or_default(), worker_args))
}

async fn dispatch(
    config: ConfigSnapshot,
    config_path: std::path::PathBuf,
    worker_args: WorkerArgs,
) -> anyhow::Result<()> {
    match config.process_type {
        ProcessType::Combined => run_combined(config, config_path).await,
        ProcessType::Single => run_single_mode(config).await,
        ProcessType::Utility | ProcessType::Agent | ProcessType::Dps => {
            run_utility_mode(config).await
        }
        ProcessType::Slave => run_slave_mode(config, worker_args).await,
    }
}

/// `ProcessType::Combined`: the master image. Opens listeners, starts the
/// worker pool, and runs until SIGTERM, then shuts down gracefully.
async fn run_combined(config: ConfigSnapshot, config_path: std::path::PathBuf) -> anyhow::Result<()> {
    let spawner = SlaveSpawnerService {
        // No interpreter: each worker is this same native executable
        // re-invoked with overrides, not a script handed to a language
        // runtime, so argv[0] folds back to `supervisor_executable` (see
        // `SlaveSpawnerService::spawn`).
        interpreter: std::ffi::OsString::new(),
        supervisor_executable: std::env::current_exe()?,
        plugin_name: config.plugin_name.clone(),
        config_path,
        pid_file_dir: config.pid_file_dir.clone(),
        control_port: config.control_port,
    };

    let access_log_path = config.pid_file_dir.join("access.log");
    let tls_available = config.listeners.iter().any(|l| l.tls);

    let orchestrator =
        CombinedOrchestrator::build(&config, spawner, &access_log_path, tls_available).await?;

    wait_for_sigterm().await?;
    tracing::info!("received SIGTERM, stopping all workers");
    orchestrator.shutdown().await;
    Ok(())
}

/// `ProcessType::Single`: no worker subprocesses. The in-process request
/// service is an external collaborator out of scope here, so this mode
/// supervises an empty helper-daemon set and otherwise just waits for
/// SIGTERM; a caller embedding this crate supplies real helper daemons via
/// `watchtower_orchestrator::run_single` directly instead of this binary.
async fn run_single_mode(config: ConfigSnapshot) -> anyhow::Result<()> {
    let monitor = run_single(&config, Vec::new()).await?;
    wait_for_sigterm().await?;
    tracing::info!("received SIGTERM, stopping helper daemons");
    monitor.stop_service().await;
    Ok(())
}

/// `ProcessType::Utility`, `ProcessType::Agent`, and `ProcessType::Dps`:
/// one-shot tasks with a store handle (external collaborator, out of
/// scope). With no storage engine wired at this layer there is nothing to
/// do but confirm the mode resolved correctly and exit zero, matching the
/// "never opens listeners" contract.
async fn run_utility_mode(config: ConfigSnapshot) -> anyhow::Result<()> {
    let process_type = config.process_type;
    run_utility_or_agent(Box::new(move || {
        tracing::info!(%process_type, "one-shot task has no storage handle wired at this layer");
        Ok(())
    }))
    .await
}

/// `ProcessType::Slave`: re-invoked by the master's slave-spawner service.
/// Writes its own PID file (if `-o PIDFile=...` was given), then either
/// blocks receiving dispatched connections on the inherited meta-FD
/// (`-o MetaFD=...`, the normal path) or accepts directly on the listening
/// sockets it inherited across `exec()` (`-o InheritFDs=`/`-o InheritSSLFDs=`,
/// the classic fallback for platforms without `SCM_RIGHTS` FD passing).
/// Handing the accepted socket off to the CalDAV/CardDAV request service is
/// an external collaborator out of scope here; this stand-in only confirms
/// the dispatch handoff itself works.
async fn run_slave_mode(config: ConfigSnapshot, worker_args: WorkerArgs) -> anyhow::Result<()> {
    if let Some(path) = &worker_args.pid_file {
        pid_file::write_pid_file(path)?;
    }
    let log_id = worker_args.log_id;
    tracing::info!(log_id, plugin = %config.plugin_name, "slave worker starting");
    let on_connection: watchtower_orchestrator::ConnectionHandler = std::sync::Arc::new(
        move |_fd: std::os::fd::OwnedFd, tag: u8| {
            tracing::debug!(log_id, tag = tag as char, "dispatched connection received");
        },
    );
    if worker_args.inherit_fds.is_empty() && worker_args.inherit_ssl_fds.is_empty() {
        run_slave(on_connection).await
    } else {
        tracing::info!(
            log_id,
            plain = worker_args.inherit_fds.len(),
            ssl = worker_args.inherit_ssl_fds.len(),
            "accepting on inherited listening sockets, classic fallback mode"
        );
        run_slave_inherited_fds(worker_args.inherit_fds, worker_args.inherit_ssl_fds, on_connection).await
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> anyhow::Result<()> {
    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    stream.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
