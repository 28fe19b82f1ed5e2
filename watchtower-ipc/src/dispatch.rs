// SPDX-License-Identifier: Apache-2.0

//! The FD-passing connection dispatcher (component C4): owns the master's
//! listening sockets, accepts connections in the master, and hands each
//! accepted file descriptor to a specific worker over a per-worker
//! `SOCK_DGRAM` pair using `SCM_RIGHTS` ancillary data.
//!
//! Every method takes `&self`: the worker table is guarded by a short-lived
//! `std::sync::Mutex` critical section that never spans an `.await`, so a
//! `Dispatcher` can be shared as a plain `Arc` across every listener's
//! accept loop, the acknowledgement poller, and the process monitor's
//! synchronous start/exit hooks without risking a lock held across
//! suspension or a `blocking_lock` panic from an async context.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sendfd::{RecvWithFd, SendWithFd};
use tokio::io::Interest;
use tokio::net::{TcpListener, UnixDatagram};

use crate::platform::{AcceptedConnection, PlatformHandle, WorkerDatagram};

/// Tag carried in the one-byte FD-passing datagram, telling the worker
/// whether the accepted connection must be wrapped in TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerTag {
    Tcp,
    Ssl,
}

impl ListenerTag {
    /// The tag byte carried in the FD-passing datagram (`T`/`S`). Also used
    /// by the classic inherited-fd accept fallback, which has no dispatch
    /// datagram to carry it but still needs to tell the worker whether a
    /// connection needs TLS wrapping.
    pub fn wire_byte(self) -> u8 {
        match self {
            ListenerTag::Tcp => b'T',
            ListenerTag::Ssl => b'S',
        }
    }
}

/// Worker -> master acknowledgement byte.
const ACK_ACCEPTED: u8 = b'+';
const ACK_REJECTED: u8 = b'-';

pub struct ListeningSocketRecord {
    pub tag: ListenerTag,
    listener: TcpListener,
}

impl ListeningSocketRecord {
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Active,
    Stopped,
}

pub struct WorkerSocketRecord {
    pub slot_id: u32,
    master_end: Arc<UnixDatagram>,
    /// Held for the lifetime of the slot, not taken: the socket pair
    /// outlives any number of worker respawns, so every spawn attempt
    /// duplicates a fresh descriptor from this one via [`Self::dup_child_end`]
    /// rather than consuming it.
    child_end: Option<PlatformHandle<WorkerDatagram>>,
    pub status: WorkerStatus,
    pub outstanding: usize,
    last_dispatched_at: u64,
    /// Set once `outstanding` reaches `max_requests`, cleared only once it
    /// drains back down to the low-water mark (75% of `max_requests`,
    /// rounded down). Keeps a worker from oscillating in and out of
    /// eligibility right at the cap boundary.
    excluded: bool,
}

impl WorkerSocketRecord {
    /// Duplicates the held `child_end` without giving up the master's own
    /// copy. The monitor's launcher calls this on every spawn attempt,
    /// including restarts.
    pub fn dup_child_end(&self) -> io::Result<OwnedFd> {
        let Some(fd) = &self.child_end else {
            return Err(io::Error::other("worker socket has no child end to duplicate"));
        };
        // SAFETY: `dup` returns a fresh, independently-owned descriptor or
        // -1 on error; we check for -1 below.
        let duped = unsafe { libc::dup(fd.as_raw_fd()) };
        if duped < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `duped` was just returned by `dup` above and is not used
        // anywhere else.
        Ok(unsafe { OwnedFd::from_raw_fd(duped) })
    }

    fn eligible(&self, max_requests: usize) -> bool {
        self.status == WorkerStatus::Active
            && self.outstanding < max_requests
            && !self.excluded
    }

    /// Recomputes `excluded` from the current `outstanding` count. Must be
    /// called after every change to `outstanding`.
    fn refresh_exclusion(&mut self, max_requests: usize) {
        if self.outstanding >= max_requests {
            self.excluded = true;
        } else if self.outstanding <= low_water_mark(max_requests) {
            self.excluded = false;
        }
    }
}

/// 75% of `max_requests`, rounded down.
fn low_water_mark(max_requests: usize) -> usize {
    (max_requests * 3) / 4
}

/// Owns listeners and worker sockets, and implements least-loaded FD
/// dispatch with the global/per-worker admission caps from the
/// specification.
pub struct Dispatcher {
    listeners: Vec<ListeningSocketRecord>,
    workers: Mutex<HashMap<u32, WorkerSocketRecord>>,
    max_accepts: usize,
    max_requests: usize,
    dispatch_sequence: AtomicU64,
}

impl Dispatcher {
    pub fn new(max_accepts: usize, max_requests: usize) -> Self {
        Dispatcher {
            listeners: Vec::new(),
            workers: Mutex::new(HashMap::new()),
            max_accepts,
            max_requests,
            dispatch_sequence: AtomicU64::new(0),
        }
    }

    /// Binds and listens on `address` with the given `backlog`, so a burst
    /// of connect attempts queues in the kernel (up to `backlog`) instead of
    /// being refused outright -- the backpressure the dispatcher's "defer
    /// when no worker is eligible" policy relies on. `TcpListener::bind`
    /// alone has no way to pass a backlog, hence building the socket with
    /// `socket2` first and only handing it to tokio once it is listening.
    pub async fn add_listener(
        &mut self,
        address: std::net::SocketAddr,
        backlog: i32,
        tag: ListenerTag,
    ) -> io::Result<usize> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(address),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&address.into())?;
        socket.listen(backlog)?;
        let listener = TcpListener::from_std(socket.into())?;
        self.listeners.push(ListeningSocketRecord { tag, listener });
        Ok(self.listeners.len() - 1)
    }

    pub fn listener(&self, id: usize) -> &ListeningSocketRecord {
        &self.listeners[id]
    }

    /// Creates the `SOCK_DGRAM` pair for a new worker slot.
    pub fn add_socket(&self, slot_id: u32) -> io::Result<()> {
        let (a, b) = std::os::unix::net::UnixDatagram::pair()?;
        a.set_nonblocking(true)?;
        let master_end = Arc::new(UnixDatagram::from_std(a)?);
        b.set_nonblocking(false)?;
        let child_end: PlatformHandle<WorkerDatagram> = OwnedFd::from(b).into();
        #[allow(clippy::unwrap_used)]
        self.workers.lock().unwrap().insert(
            slot_id,
            WorkerSocketRecord {
                slot_id,
                master_end,
                child_end: Some(child_end),
                status: WorkerStatus::Starting,
                outstanding: 0,
                last_dispatched_at: 0,
                excluded: false,
            },
        );
        Ok(())
    }

    pub fn start(&self, slot_id: u32) {
        #[allow(clippy::unwrap_used)]
        if let Some(w) = self.workers.lock().unwrap().get_mut(&slot_id) {
            w.status = WorkerStatus::Active;
        }
    }

    pub fn stop(&self, slot_id: u32) {
        #[allow(clippy::unwrap_used)]
        if let Some(w) = self.workers.lock().unwrap().get_mut(&slot_id) {
            w.status = WorkerStatus::Stopped;
            w.outstanding = 0;
        }
    }

    pub fn remove(&self, slot_id: u32) {
        #[allow(clippy::unwrap_used)]
        self.workers.lock().unwrap().remove(&slot_id);
    }

    /// Duplicates the worker's `child_end`, without holding the worker
    /// table lock any longer than the lookup itself.
    pub fn dup_child_end(&self, slot_id: u32) -> io::Result<OwnedFd> {
        #[allow(clippy::unwrap_used)]
        let workers = self.workers.lock().unwrap();
        let worker = workers
            .get(&slot_id)
            .ok_or_else(|| io::Error::other(format!("no worker socket for slot {slot_id}")))?;
        worker.dup_child_end()
    }

    /// Picks the least-loaded `Active` worker under the per-worker cap,
    /// breaking ties by least-recently-dispatched. Returns `None` when no
    /// worker is eligible, in which case the caller should defer accepting
    /// further connections.
    fn select_worker(&self) -> Option<u32> {
        #[allow(clippy::unwrap_used)]
        self.workers
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.eligible(self.max_requests))
            .min_by_key(|w| (w.outstanding, w.last_dispatched_at))
            .map(|w| w.slot_id)
    }

    pub fn any_worker_active(&self) -> bool {
        #[allow(clippy::unwrap_used)]
        self.workers
            .lock()
            .unwrap()
            .values()
            .any(|w| w.status == WorkerStatus::Active)
    }

    /// Accepts at most one connection from listener `listener_id` and hands
    /// it to the least-loaded eligible worker. Returns `Ok(None)` when no
    /// worker is currently eligible (the caller should not call `accept`
    /// again on this listener until a worker becomes `Active`).
    pub async fn accept_and_dispatch(&self, listener_id: usize) -> io::Result<Option<u32>> {
        let Some(slot_id) = self.select_worker() else {
            return Ok(None);
        };
        let (stream, _peer) = self.listeners[listener_id].listener.accept().await?;
        let tag = self.listeners[listener_id].tag;
        let raw_fd = stream.into_std()?.into_raw_fd();
        // SAFETY: `raw_fd` was just produced by `into_raw_fd` above and is
        // not used anywhere else.
        let owned_fd: PlatformHandle<AcceptedConnection> =
            unsafe { PlatformHandle::from_raw_fd(raw_fd) };

        let sequence = self.dispatch_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let master_end = {
            #[allow(clippy::unwrap_used)]
            let workers = self.workers.lock().unwrap();
            let worker = workers
                .get(&slot_id)
                .ok_or_else(|| io::Error::other("selected worker vanished"))?;
            worker.master_end.clone()
        };
        send_fd(&master_end, tag.wire_byte(), owned_fd.as_raw_fd()).await?;
        {
            #[allow(clippy::unwrap_used)]
            let mut workers = self.workers.lock().unwrap();
            if let Some(worker) = workers.get_mut(&slot_id) {
                worker.outstanding += 1;
                worker.last_dispatched_at = sequence;
                worker.refresh_exclusion(self.max_requests);
            }
        }
        // The duplicate-owning fd in `owned_fd` is closed here; the kernel
        // has already duplicated it into the worker's receiving socket.
        drop(owned_fd);
        Ok(Some(slot_id))
    }

    /// Drains any pending acknowledgement datagrams from every worker,
    /// decrementing `outstanding` for each `+`/`-` byte received.
    pub async fn poll_acks(&self) -> io::Result<()> {
        let master_ends: Vec<(u32, Arc<UnixDatagram>)> = {
            #[allow(clippy::unwrap_used)]
            self.workers
                .lock()
                .unwrap()
                .values()
                .map(|w| (w.slot_id, w.master_end.clone()))
                .collect()
        };
        for (slot_id, master_end) in master_ends {
            loop {
                match recv_ack(&master_end).await {
                    Ok(Some(_byte)) => {
                        #[allow(clippy::unwrap_used)]
                        if let Some(w) = self.workers.lock().unwrap().get_mut(&slot_id) {
                            w.outstanding = w.outstanding.saturating_sub(1);
                            w.refresh_exclusion(self.max_requests);
                        }
                    }
                    Ok(None) => break,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    pub fn max_accepts(&self) -> usize {
        self.max_accepts
    }
}

async fn send_fd(socket: &UnixDatagram, tag: u8, fd: RawFd) -> io::Result<()> {
    loop {
        socket.writable().await?;
        let buf = [tag];
        match socket.try_io(Interest::WRITABLE, || {
            (&*socket).send_with_fd(&buf, &[fd])
        }) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Non-blocking single read of one acknowledgement byte; `Ok(None)` means no
/// datagram is currently queued.
async fn recv_ack(socket: &UnixDatagram) -> io::Result<Option<u8>> {
    let mut buf = [0u8; 1];
    match socket.try_io(Interest::READABLE, || {
        let mut fds = [0 as RawFd; 0];
        (&*socket).recv_with_fd(&mut buf, &mut fds).map(|(n, _)| n)
    }) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(buf[0])),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

/// Worker-side counterpart: receives one datagram carrying the listener tag
/// and the accepted connection's FD. Used by the worker process after
/// inheriting its `child_end`.
pub fn worker_recv_connection(socket: &std::os::unix::net::UnixDatagram) -> io::Result<(u8, OwnedFd)> {
    let mut buf = [0u8; 1];
    let mut fds = [0 as RawFd; 1];
    let (_n, fd_count) = socket.recv_with_fd(&mut buf, &mut fds)?;
    if fd_count == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected exactly one passed file descriptor",
        ));
    }
    // SAFETY: the kernel just handed us ownership of this descriptor via
    // SCM_RIGHTS.
    let owned = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    Ok((buf[0], owned))
}

/// Worker-side acknowledgement send (`+` accepted, `-` rejected).
pub fn worker_send_ack(socket: &std::os::unix::net::UnixDatagram, accepted: bool) -> io::Result<()> {
    let byte = if accepted { ACK_ACCEPTED } else { ACK_REJECTED };
    socket.send_with_fd(&[byte], &[] as &[RawFd])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn least_loaded_selection_alternates_between_two_equal_workers() {
        let dispatcher = Dispatcher::new(100, 10);
        dispatcher.add_socket(1).unwrap();
        dispatcher.add_socket(2).unwrap();
        dispatcher.start(1);
        dispatcher.start(2);

        assert_eq!(dispatcher.select_worker(), Some(1).or(Some(2)));
        // Simulate one dispatch to worker 1.
        {
            #[allow(clippy::unwrap_used)]
            let mut workers = dispatcher.workers.lock().unwrap();
            let w = workers.get_mut(&1).unwrap();
            w.outstanding = 1;
            w.last_dispatched_at = 1;
        }
        assert_eq!(dispatcher.select_worker(), Some(2));
    }

    #[tokio::test]
    async fn no_eligible_worker_when_none_active() {
        let dispatcher = Dispatcher::new(100, 10);
        dispatcher.add_socket(1).unwrap();
        assert_eq!(dispatcher.select_worker(), None);
    }

    #[tokio::test]
    async fn child_end_can_be_duplicated_more_than_once() {
        let dispatcher = Dispatcher::new(100, 10);
        dispatcher.add_socket(1).unwrap();
        let first = dispatcher.dup_child_end(1).unwrap();
        let second = dispatcher.dup_child_end(1).unwrap();
        assert_ne!(first.as_raw_fd(), second.as_raw_fd());
    }

    #[tokio::test]
    async fn worker_over_cap_is_excluded() {
        let dispatcher = Dispatcher::new(100, 2);
        dispatcher.add_socket(1).unwrap();
        dispatcher.start(1);
        {
            #[allow(clippy::unwrap_used)]
            let mut workers = dispatcher.workers.lock().unwrap();
            workers.get_mut(&1).unwrap().outstanding = 2;
        }
        assert_eq!(dispatcher.select_worker(), None);
    }
}
