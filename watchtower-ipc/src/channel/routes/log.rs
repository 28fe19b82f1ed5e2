// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::channel::{Route, RouteHandler};

/// Appends every received payload, verbatim, to a shared access-log file.
/// Payload framing (one record per frame) is the caller's concern; this
/// handler does not add its own newline since workers are expected to send
/// already-terminated records.
///
/// Every connection's `on_frame` calls only enqueue onto a channel fed to a
/// single dedicated writer task (spawned once by [`log_route`]); the writer
/// drains that channel strictly in arrival order and awaits each disk write
/// before taking the next one, so frames from one worker connection --
/// delivered to `on_frame` in order -- are never reordered or interleaved on
/// their way to the file.
pub struct LogRouteHandler {
    sender: mpsc::UnboundedSender<Bytes>,
}

impl RouteHandler for LogRouteHandler {
    fn on_frame(&mut self, payload: Bytes) -> anyhow::Result<()> {
        self.sender
            .send(payload)
            .map_err(|_| anyhow::anyhow!("access log writer task is no longer running"))
    }
}

/// Builds the `log` route, backed by an already-open access-log file.
///
/// Spawns the one writer task every handler instance feeds: disk writes are
/// blocking I/O, so each dequeued frame is written on the blocking-task
/// pool (per the reactor/thread-pool bootstrap-ordering design note), but
/// the writer awaits that write before dequeuing the next frame, which is
/// what keeps the appends ordered instead of racing on the file `Mutex`.
pub fn log_route(file: Arc<Mutex<std::fs::File>>) -> Route {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            let file = file.clone();
            let write = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                #[allow(clippy::unwrap_used)]
                let mut file = file.lock().unwrap();
                file.write_all(&payload)?;
                Ok(())
            })
            .await;
            match write {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "failed to append access log record");
                }
                Err(err) => {
                    tracing::error!(error = %err, "access log writer task panicked");
                }
            }
        }
    });
    Route::new("log", move || {
        Box::new(LogRouteHandler { sender: tx.clone() }) as Box<dyn RouteHandler>
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ControlChannel, ControlChannelBuilder};
    use tokio::io::duplex;
    use tokio_util::codec::{Framed, LengthDelimitedCodec};

    #[tokio::test]
    async fn frames_on_one_connection_are_appended_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let file = Arc::new(Mutex::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .unwrap(),
        ));
        let channel = ControlChannelBuilder::new().with_route(log_route(file)).build();

        let (client, server) = duplex(4096);
        let mut client_framed = Framed::new(client, LengthDelimitedCodec::new());
        let server_task = tokio::spawn(async move { channel.serve_connection(server).await });

        for line in ["first\n", "second\n", "third\n"] {
            ControlChannel::send_frame(&mut client_framed, "log", line.as_bytes())
                .await
                .unwrap();
        }
        drop(client_framed);
        server_task.await.unwrap().unwrap();

        // Give the writer task a chance to drain the channel; the last
        // frame's `spawn_blocking` write may still be in flight right after
        // `serve_connection` returns.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\nthird\n");
    }
}
