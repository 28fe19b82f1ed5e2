// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Builds the argv, environment, and inherited-FD table for a supervised
//! child and spawns it.
//!
//! The builder's shape (`SpawnBuilder::new(...).stdin(...).pass_fd(...).uid(...).spawn()`)
//! follows the call-site idiom of a dlopen-trampoline spawner this crate
//! started from; the implementation underneath is classic `fork()+exec()`
//! via `std::process::Command`, since every process record here carries an
//! explicit, literal `argv` rather than a self re-exec entry point.

pub mod builder;
pub mod signal;
pub mod slave;

pub use builder::{SpawnBuilder, SpawnedChild, Stdio};
pub use slave::{SlaveSpawnerService, WorkerIdentity};
