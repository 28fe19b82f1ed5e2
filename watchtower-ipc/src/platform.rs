// SPDX-License-Identifier: Apache-2.0

//! A typed, owning wrapper around a raw file descriptor, so the dispatcher
//! and control channel can pass "a listening socket" or "an accepted
//! connection" around without losing track of which kind of handle it is.

use std::marker::PhantomData;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// Tags a raw descriptor with the type of thing it represents, without
/// adding any runtime cost: `PlatformHandle<T>` is `OwnedFd` plus a
/// zero-sized marker.
pub struct PlatformHandle<T> {
    fd: OwnedFd,
    _marker: PhantomData<T>,
}

impl<T> PlatformHandle<T> {
    /// # Safety
    /// `fd` must be a valid, open, owned file descriptor not used elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        PlatformHandle {
            fd: OwnedFd::from_raw_fd(fd),
            _marker: PhantomData,
        }
    }

    pub fn into_owned_fd(self) -> OwnedFd {
        self.fd
    }

    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl<T> AsRawFd for PlatformHandle<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl<T> From<OwnedFd> for PlatformHandle<T> {
    fn from(fd: OwnedFd) -> Self {
        PlatformHandle {
            fd,
            _marker: PhantomData,
        }
    }
}

/// Marker type for a handle that has been accepted in the master and is
/// awaiting dispatch to a worker.
pub struct AcceptedConnection;

/// Marker type for the datagram endpoint the dispatcher uses to pass
/// accepted connections to one worker.
pub struct WorkerDatagram;
