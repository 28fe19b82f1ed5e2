// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! The process monitor (C5), memory-limit enforcer (C6), and start-ordering
//! step sequencer (C7).

pub mod memory;
pub mod monitor;
pub mod sequence;

pub use memory::MemoryEnforcer;
pub use monitor::{Monitor, MonitorTiming};
pub use sequence::{Outcome, Sequencer, Step};
