// SPDX-License-Identifier: Apache-2.0

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the process-wide `tracing` subscriber. Safe to call once per
/// process; the master calls it before constructing any other component,
/// workers call it again after re-exec since they start a fresh process
/// image.
///
/// Honors `RUST_LOG`, defaulting to `info` when unset, matching the
/// `tracing-subscriber` feature wiring used elsewhere in this workspace.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
