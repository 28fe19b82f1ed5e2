// SPDX-License-Identifier: Apache-2.0

//! The slave-spawner service (component C8): builds the argv, environment,
//! and inherited-FD table for one worker and hands it to [`SpawnBuilder`].

use std::ffi::OsString;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use watchtower_common::env::inherited_env;

use crate::builder::{SpawnBuilder, SpawnedChild, Stdio};

/// The file descriptor number the per-worker dispatcher datagram socket is
/// installed at in every worker, matching the `-o MetaFD=3` convention.
pub const META_FD_SLOT: i32 = 3;

/// Identifies one worker slot: its `LogID` (used in PID filenames and as
/// the dispatcher's key) and the listening addresses it should bind.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub log_id: u32,
    pub bind_addresses: Vec<std::net::SocketAddr>,
}

/// How the worker learns about connections: a meta-FD socket (FD-passing
/// dispatch mode) or a set of directly inherited listening sockets
/// (classic accept-in-every-process mode).
pub enum ConnectionMode {
    MetaFd(OwnedFd),
    InheritFds {
        plain: Vec<i32>,
        ssl: Vec<i32>,
    },
}

pub struct SlaveSpawnerService {
    pub interpreter: OsString,
    pub supervisor_executable: PathBuf,
    pub plugin_name: String,
    pub config_path: PathBuf,
    pub pid_file_dir: PathBuf,
    pub control_port: u16,
}

impl SlaveSpawnerService {
    /// Constructs the full command line for a worker, following the
    /// `-o key=value` overlay convention: `ProcessType=Slave`,
    /// `BindAddresses=...`, `PIDFile=...`, `LogID=...`, `ControlPort=...`,
    /// and either `MetaFD=...` or `InheritFDs=.../InheritSSLFDs=...`.
    pub fn build_argv(&self, worker: &WorkerIdentity, mode: &ConnectionMode) -> Vec<OsString> {
        let pid_file = self
            .pid_file_dir
            .join(format!("{}-instance-{}.pid", self.plugin_name, worker.log_id));

        let bind_addresses = worker
            .bind_addresses
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut argv = vec![
            self.interpreter.clone(),
            OsString::from(&self.supervisor_executable),
            OsString::from(&self.plugin_name),
            OsString::from("--config"),
            OsString::from(&self.config_path),
            OsString::from("-o"),
            OsString::from("ProcessType=Slave"),
            OsString::from("-o"),
            OsString::from(format!("BindAddresses={bind_addresses}")),
            OsString::from("-o"),
            OsString::from(format!("PIDFile={}", pid_file.display())),
            OsString::from("-o"),
            OsString::from(format!("LogID={}", worker.log_id)),
            OsString::from("-o"),
            OsString::from(format!("ControlPort={}", self.control_port)),
        ];

        match mode {
            ConnectionMode::MetaFd(_) => {
                argv.push(OsString::from("-o"));
                argv.push(OsString::from(format!("MetaFD={META_FD_SLOT}")));
            }
            ConnectionMode::InheritFds { plain, ssl } => {
                let join = |v: &[i32]| {
                    v.iter()
                        .map(i32::to_string)
                        .collect::<Vec<_>>()
                        .join(",")
                };
                argv.push(OsString::from("-o"));
                argv.push(OsString::from(format!("InheritFDs={}", join(plain))));
                argv.push(OsString::from("-o"));
                argv.push(OsString::from(format!("InheritSSLFDs={}", join(ssl))));
            }
        }
        argv
    }

    /// Builds and spawns the worker, installing the meta-FD (if any) at
    /// [`META_FD_SLOT`] and inheriting the process-wide environment
    /// whitelist plus any explicit overrides.
    pub fn spawn(
        &self,
        worker: &WorkerIdentity,
        mode: ConnectionMode,
        uid: Option<u32>,
        gid: Option<u32>,
        overrides: impl IntoIterator<Item = (OsString, OsString)>,
    ) -> std::io::Result<SpawnedChild> {
        let argv = self.build_argv(worker, &mode);
        let mut program = argv[0].clone();
        let mut rest = argv[1..].to_vec();
        // The interpreter is argv[0]; when there is none (a native
        // executable worker) fold the supervisor path back to argv[0].
        if program.is_empty() {
            program = rest.remove(0);
        }

        let mut builder = SpawnBuilder::new(program)
            .args(rest)
            .envs(inherited_env())
            .envs(overrides)
            .stdin(Stdio::Null)
            .stdout(Stdio::Piped)
            .stderr(Stdio::Piped);

        if let Some(uid) = uid {
            builder = builder.uid(uid);
        }
        if let Some(gid) = gid {
            builder = builder.gid(gid);
        }

        if let ConnectionMode::MetaFd(fd) = mode {
            builder = builder.pass_fd(META_FD_SLOT, fd);
        }

        builder.spawn()
    }
}
