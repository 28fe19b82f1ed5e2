// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::str::FromStr;
use std::time::Duration;

use crate::error::WatchtowerError;

/// Selects what role a spawned (or the current) process plays.
///
/// `Slave` is kept as the wire-visible name passed to workers via
/// `-o ProcessType=Slave`; externally we also accept and emit `Worker` as a
/// synonym so operators are not forced to use the legacy spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessType {
    Combined,
    Single,
    Slave,
    Utility,
    Agent,
    Dps,
}

impl ProcessType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessType::Combined => "Combined",
            ProcessType::Single => "Single",
            ProcessType::Slave => "Slave",
            ProcessType::Utility => "Utility",
            ProcessType::Agent => "Agent",
            ProcessType::Dps => "DPS",
        }
    }
}

impl std::fmt::Display for ProcessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessType {
    type Err = WatchtowerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Combined" => Ok(ProcessType::Combined),
            "Single" => Ok(ProcessType::Single),
            "Slave" | "Worker" => Ok(ProcessType::Slave),
            "Utility" => Ok(ProcessType::Utility),
            "Agent" => Ok(ProcessType::Agent),
            "DPS" => Ok(ProcessType::Dps),
            other => Err(WatchtowerError::UnknownProcessType(other.to_string())),
        }
    }
}

/// Supervision state of one registered child, mirroring the specification's
/// `NotStarted -> Starting -> Running -> Stopping -> Stopped` lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// How to build the argv/env/fd table for one child, independent of whether
/// that child is a plain external command or a worker constructed by
/// `watchtower-spawn`'s slave-spawner service.
pub trait ProcessSpec: Send + Sync {
    /// Resolved at spawn time, not at registration time, so a late-binding FD
    /// (e.g. a just-allocated meta-FD) can be captured in argv overrides.
    fn command_line(&self) -> Vec<OsString>;
    fn extra_fds(&self) -> BTreeMap<i32, i32> {
        BTreeMap::new()
    }
    fn on_starting(&self) {}
    fn on_stopped(&self) {}
}

/// The trivial `ProcessSpec` implementation the design notes call for: a
/// fixed, already-resolved argv plus a fixed extra-FD table, with no
/// late-binding behavior in `on_starting`/`on_stopped`.
#[derive(Debug, Clone, Default)]
pub struct StaticArgvSpec {
    argv: Vec<OsString>,
    extra_fds: BTreeMap<i32, i32>,
}

impl StaticArgvSpec {
    pub fn new(argv: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        StaticArgvSpec {
            argv: argv.into_iter().map(Into::into).collect(),
            extra_fds: BTreeMap::new(),
        }
    }

    /// Records that the child should receive `master_fd` as file descriptor
    /// number `child_fd`, matching the Process Record's `extra_fds` mapping.
    pub fn with_extra_fd(mut self, child_fd: i32, master_fd: i32) -> Self {
        self.extra_fds.insert(child_fd, master_fd);
        self
    }
}

impl ProcessSpec for StaticArgvSpec {
    fn command_line(&self) -> Vec<OsString> {
        self.argv.clone()
    }

    fn extra_fds(&self) -> BTreeMap<i32, i32> {
        self.extra_fds.clone()
    }
}

/// A process record keyed by unique name. Named fields throughout -- no
/// positional tuple ever stands in for this type, so insertion order and
/// field order can never drift apart from each other.
pub struct ProcessRecord<S: ProcessSpec> {
    pub name: String,
    pub spec: S,
    pub env: BTreeMap<OsString, OsString>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub current_delay: Duration,
    pub started_at: Option<std::time::Instant>,
    pub state: ProcessState,
}

impl<S: ProcessSpec> ProcessRecord<S> {
    pub fn new(
        name: impl Into<String>,
        spec: S,
        env: BTreeMap<OsString, OsString>,
        uid: Option<u32>,
        gid: Option<u32>,
        min_restart_delay: Duration,
    ) -> Self {
        ProcessRecord {
            name: name.into(),
            spec,
            env,
            uid,
            gid,
            current_delay: min_restart_delay,
            started_at: None,
            state: ProcessState::NotStarted,
        }
    }
}

impl<S: ProcessSpec> std::fmt::Debug for ProcessRecord<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRecord")
            .field("name", &self.name)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("state", &self.state)
            .field("current_delay", &self.current_delay)
            .finish()
    }
}
