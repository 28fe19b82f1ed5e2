// SPDX-License-Identifier: Apache-2.0

//! Stale Unix-domain socket cleanup, run by every orchestrator mode at
//! start. A known socket path is stale if it is not actually a socket, or
//! if it is a socket but nothing is listening on any of the addresses the
//! corresponding service would be reachable at.

use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Removes every path in `socket_paths` that is stale: missing is fine
/// (nothing to do); present but not a socket is always removed with a
/// warning; present and a socket is removed only if every address in
/// `probe_ports` fails to accept a connection.
///
/// Idempotent: running this twice with no server running removes nothing
/// the second time, since the first pass already removed every stale path.
pub fn clean_stale_sockets(socket_paths: &[PathBuf], probe_ports: &[u16]) -> std::io::Result<()> {
    for path in socket_paths {
        clean_one(path, probe_ports)?;
    }
    Ok(())
}

fn clean_one(path: &Path, probe_ports: &[u16]) -> std::io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if !is_socket(&metadata) {
        tracing::warn!(path = %path.display(), "deleting stale socket file (not a socket)");
        std::fs::remove_file(path)?;
        return Ok(());
    }

    if probe_ports.is_empty() {
        return Ok(());
    }

    let any_reachable = probe_ports.iter().any(|port| probe_port(*port));
    if !any_reachable {
        tracing::warn!(
            path = %path.display(),
            "deleting stale socket file (not accepting connections)"
        );
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn is_socket(metadata: &std::fs::Metadata) -> bool {
    metadata.file_type().is_socket()
}

#[cfg(not(unix))]
fn is_socket(_metadata: &std::fs::Metadata) -> bool {
    false
}

fn probe_port(port: u16) -> bool {
    TcpStream::connect_timeout(
        &std::net::SocketAddr::from(([127, 0, 0, 1], port)),
        PROBE_TIMEOUT,
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.sock");
        clean_stale_sockets(&[path.clone()], &[]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn non_socket_file_is_removed_regardless_of_probes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"hello").unwrap();
        clean_stale_sockets(&[path.clone()], &[]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn real_socket_with_nothing_listening_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        drop(_listener);
        // `bind` leaves the file behind after the listener is dropped,
        // matching a process that died without unlinking its socket.
        // Port 0 never accepts, so every probe fails.
        clean_stale_sockets(&[path.clone()], &[0]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"hello").unwrap();
        clean_stale_sockets(&[path.clone()], &[]).unwrap();
        assert!(!path.exists());
        // Second pass: the path no longer exists, so this is a no-op, not
        // an error.
        clean_stale_sockets(&[path], &[]).unwrap();
    }
}
