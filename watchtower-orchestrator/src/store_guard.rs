// SPDX-License-Identifier: Apache-2.0

//! Handles `WatchtowerError::StoreNotAvailable`: the step sequencer's (C7)
//! upgrade steps report this when the storage engine comes up unusable.
//! Modeled on `DelayedStartupProcessMonitor`'s caller in
//! `original_source/calendarserver/tap/caldav.py::CalDAVServiceMaker.stepWithFailure`:
//! run a configured external disabling program to completion (if one is
//! configured and exists), wait a fixed grace period, then stop -- so the
//! supervising init system sees a clean exit and does not keep relaunching a
//! job whose store will never become usable.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long to wait after the disabling program exits (or immediately, if
/// none is configured) before the caller tears the reactor down. Matches the
/// source's fixed `time.sleep(60)`.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Runs the configured external service-disabling program to completion, if
/// `disabling_program` is `Some` and the path exists and is executable.
/// Always waits out [`SHUTDOWN_GRACE_PERIOD`] afterward (or immediately, if
/// no program ran), so the caller's subsequent shutdown is never racing the
/// disabling program's own cleanup.
///
/// The sleep itself goes through `sleep_fn` rather than `tokio::time::sleep`
/// directly, so tests can substitute a fast stand-in and assert the grace
/// period was actually requested.
pub async fn handle_store_not_available<F, Fut>(
    disabling_program: Option<&Path>,
    sleep_fn: F,
) -> anyhow::Result<()>
where
    F: FnOnce(Duration) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    tracing::error!("data store not available; shutting down");

    if let Some(program) = disabling_program {
        if program.exists() {
            tracing::error!(program = %program.display(), "disabling service via external program");
            run_disabling_program(program).await?;
        } else {
            tracing::warn!(
                program = %program.display(),
                "configured service-disabling program does not exist, skipping"
            );
        }
    }

    sleep_fn(SHUTDOWN_GRACE_PERIOD).await;
    Ok(())
}

async fn run_disabling_program(program: &Path) -> anyhow::Result<()> {
    let output = tokio::process::Command::new(program)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await?;
    if !output.status.success() {
        tracing::warn!(
            program = %program.display(),
            status = %output.status,
            "service-disabling program exited non-zero"
        );
    }
    Ok(())
}

/// Convenience wrapper that calls [`handle_store_not_available`] with the
/// real `tokio::time::sleep`, for production callers.
pub async fn handle_store_not_available_with_real_clock(
    disabling_program: Option<&PathBuf>,
) -> anyhow::Result<()> {
    handle_store_not_available(disabling_program.map(PathBuf::as_path), tokio::time::sleep).await
}
