// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// What to connect a child's standard stream to.
#[derive(Debug, Default)]
pub enum Stdio {
    #[default]
    Inherit,
    Null,
    Fd(RawFd),
    /// Captured on a pipe the parent reads from, for the log relay (C2) to
    /// segment into lines.
    Piped,
}

impl Stdio {
    fn into_tokio(self) -> std::process::Stdio {
        match self {
            Stdio::Inherit => std::process::Stdio::inherit(),
            Stdio::Null => std::process::Stdio::null(),
            // SAFETY: the caller guarantees `fd` stays open and valid for
            // the duration of the spawn call.
            Stdio::Fd(fd) => unsafe { std::process::Stdio::from_raw_fd(fd) },
            Stdio::Piped => std::process::Stdio::piped(),
        }
    }
}

pub struct SpawnedChild {
    pub pid: u32,
    /// `tokio::process::Child` so the supervisor can `.wait()` for exit
    /// without blocking the single-threaded event loop.
    pub child: tokio::process::Child,
}

/// Builds one child process's command line, environment, standard streams,
/// and extra inherited file descriptors, then spawns it.
pub struct SpawnBuilder {
    program: OsString,
    args: Vec<OsString>,
    env: BTreeMap<OsString, OsString>,
    clear_env: bool,
    uid: Option<u32>,
    gid: Option<u32>,
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
    /// child-fd-number -> fd to dup2 into place before exec.
    extra_fds: Vec<(i32, OwnedFd)>,
}

impl SpawnBuilder {
    pub fn new(program: impl Into<OsString>) -> Self {
        SpawnBuilder {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            clear_env: true,
            uid: None,
            gid: None,
            stdin: Stdio::default(),
            stdout: Stdio::default(),
            stderr: Stdio::default(),
            extra_fds: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(
        mut self,
        envs: impl IntoIterator<Item = (impl Into<OsString>, impl Into<OsString>)>,
    ) -> Self {
        for (k, v) in envs {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    pub fn stdin(mut self, stdio: Stdio) -> Self {
        self.stdin = stdio;
        self
    }

    pub fn stdout(mut self, stdio: Stdio) -> Self {
        self.stdout = stdio;
        self
    }

    pub fn stderr(mut self, stdio: Stdio) -> Self {
        self.stderr = stdio;
        self
    }

    /// Installs `fd` at file descriptor number `child_fd` in the child,
    /// surviving exec (the per-worker dispatcher socket and any other
    /// passed FD).
    pub fn pass_fd(mut self, child_fd: i32, fd: OwnedFd) -> Self {
        self.extra_fds.push((child_fd, fd));
        self
    }

    pub fn spawn(self) -> io::Result<SpawnedChild> {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        if self.clear_env {
            command.env_clear();
        }
        command.envs(self.env.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str())));
        if let Some(uid) = self.uid {
            command.uid(uid);
        }
        if let Some(gid) = self.gid {
            command.gid(gid);
        }
        command.stdin(self.stdin.into_tokio());
        command.stdout(self.stdout.into_tokio());
        command.stderr(self.stderr.into_tokio());
        command.kill_on_drop(false);

        let extra_fds: Vec<(i32, RawFd)> = self
            .extra_fds
            .iter()
            .map(|(child_fd, fd)| (*child_fd, fd.as_raw_fd()))
            .collect();
        // SAFETY: `dup2` is async-signal-safe and the fds in `extra_fds` are
        // kept alive by `self.extra_fds` until `spawn` returns, which
        // outlives the fork.
        unsafe {
            command.pre_exec(move || {
                for (child_fd, source_fd) in &extra_fds {
                    if *source_fd != *child_fd && libc::dup2(*source_fd, *child_fd) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        // SAFETY of the unwrap: `id()` only returns `None` after the child
        // has already been waited on, which cannot have happened yet.
        #[allow(clippy::unwrap_used)]
        let pid = child.id().unwrap();
        Ok(SpawnedChild { pid, child })
    }
}
