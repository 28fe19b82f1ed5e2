// SPDX-License-Identifier: Apache-2.0

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Sends `sig` to the process group leader `pid`. `ESRCH` (process already
/// exited) is swallowed: the specification treats a signal to an already-dead
/// child as a no-op, not an error (`ChildExitedAlready`).
pub fn send_signal(pid: u32, sig: Signal) -> anyhow::Result<()> {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("failed to signal pid {pid}: {e}")),
    }
}

pub fn terminate(pid: u32) -> anyhow::Result<()> {
    send_signal(pid, Signal::SIGTERM)
}

pub fn kill(pid: u32) -> anyhow::Result<()> {
    send_signal(pid, Signal::SIGKILL)
}
