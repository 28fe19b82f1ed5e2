// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! The control channel (route-multiplexed stream connection) and the
//! FD-passing dispatcher that hands accepted client connections to worker
//! processes over per-worker datagram sockets.

pub mod channel;
pub mod dispatch;
pub mod platform;

pub use channel::{ControlChannel, Route};
pub use dispatch::{Dispatcher, ListenerTag, ListeningSocketRecord, WorkerSocketRecord, WorkerStatus};
