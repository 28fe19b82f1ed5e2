// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Shared data model for the watchtower process-supervision core: the
//! process record, config snapshot, process-type selector, and error
//! taxonomy used by every other crate in the workspace.

pub mod config;
pub mod env;
pub mod error;
pub mod process;

pub use config::ConfigSnapshot;
pub use error::WatchtowerError;
pub use process::{ProcessRecord, ProcessSpec, ProcessState, ProcessType, StaticArgvSpec};
