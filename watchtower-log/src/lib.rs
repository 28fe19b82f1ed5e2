// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Line-buffered relay for child stdout/stderr, plus the `tracing`
//! subscriber the master and workers initialize logging with.

pub mod init;
pub mod relay;

pub use init::init_tracing;
pub use relay::LineRelay;
