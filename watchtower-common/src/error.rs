// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// The error taxonomy surfaced at the process-supervisor's external
/// boundaries (CLI, process monitor, dispatcher). Internal glue code uses
/// `anyhow` instead; this enum exists for the cases a caller needs to match
/// on the specific failure kind.
#[derive(Debug, thiserror::Error)]
pub enum WatchtowerError {
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("data store is not available")]
    StoreNotAvailable,

    #[error("TLS context construction failed for {address}: {reason}")]
    SslError { address: String, reason: String },

    #[error("process `{0}` is already registered")]
    DuplicateProcess(String),

    #[error("process `{0}` is not registered")]
    UnknownProcess(String),

    #[error("child for `{0}` had already exited")]
    ChildExitedAlready(String),

    #[error("Unknown server type: {0}")]
    UnknownProcessType(String),

    #[error("stale socket at {0:?} could not be removed: {1}")]
    StaleSocketCleanup(PathBuf, #[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
