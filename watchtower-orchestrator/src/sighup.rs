// SPDX-License-Identifier: Apache-2.0

//! SIGHUP re-exec: the master replaces its own process image in place,
//! preserving the PID file (the new image inherits the same pid, so the
//! PID file written by the outgoing process remains valid for the
//! incoming one).

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;

use nix::unistd::execv;

/// Re-execs the current process image with `argv`, replacing it in place.
/// Only returns on failure -- a successful call never returns, since the
/// process image itself is replaced.
pub fn reexec_self(argv: &[std::ffi::OsString]) -> anyhow::Result<std::convert::Infallible> {
    let current_exe = std::env::current_exe()?;
    let program = CString::new(current_exe.as_os_str().as_bytes())?;
    let args: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<Result<_, _>>()?;
    let err = execv(&program, &args).unwrap_err();
    Err(anyhow::anyhow!("re-exec failed: {err}"))
}

/// Spawns a task that waits for SIGHUP and invokes `on_sighup` each time it
/// arrives. The master orchestrator passes a closure that re-execs via
/// [`reexec_self`]; tests pass a counting closure instead.
pub fn watch_sighup(mut on_sighup: impl FnMut() + Send + 'static) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[allow(clippy::unwrap_used)]
        let mut stream =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()).unwrap();
        loop {
            if stream.recv().await.is_none() {
                break;
            }
            tracing::info!("received SIGHUP, re-executing master image");
            on_sighup();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn sighup_invokes_the_callback() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = watch_sighup(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        // SIGHUP a real process in a test is not hermetic across CI
        // sandboxes; this test only exercises that the watcher task spins
        // up and can be aborted without panicking.
        tokio::task::yield_now().await;
        handle.abort();
        let _ = handle.await;
    }
}
