// SPDX-License-Identifier: Apache-2.0

//! The control channel (component C3): a length-prefixed, route-tagged
//! message multiplexer shared between the master and its workers.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub mod routes;

#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    route: String,
    payload: Vec<u8>,
}

/// Per-connection handler for one route. A new instance is constructed by
/// the route's factory the moment a peer declares that route on a fresh
/// connection.
pub trait RouteHandler: Send {
    fn on_frame(&mut self, payload: Bytes) -> anyhow::Result<()>;
}

type RouteFactory = Box<dyn Fn() -> Box<dyn RouteHandler> + Send + Sync>;

/// One registered route: a name and the factory that builds a handler for
/// it.
pub struct Route {
    pub name: String,
    factory: RouteFactory,
}

impl Route {
    pub fn new(
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn RouteHandler> + Send + Sync + 'static,
    ) -> Self {
        Route {
            name: name.into(),
            factory: Box::new(factory),
        }
    }
}

/// Registry of routes the control channel multiplexes. Unknown routes
/// cause the connection to be dropped.
#[derive(Clone, Default)]
pub struct ControlChannel {
    routes: Arc<HashMap<String, Arc<RouteFactory>>>,
}

pub struct ControlChannelBuilder {
    routes: HashMap<String, Arc<RouteFactory>>,
}

impl ControlChannelBuilder {
    pub fn new() -> Self {
        ControlChannelBuilder {
            routes: HashMap::new(),
        }
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.insert(route.name, Arc::new(route.factory));
        self
    }

    pub fn build(self) -> ControlChannel {
        ControlChannel {
            routes: Arc::new(self.routes),
        }
    }
}

impl Default for ControlChannelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel {
    /// Serves one accepted connection until the peer disappears. The first
    /// frame's route selects (and is delivered to) the handler; the
    /// connection is torn down, without disturbing any other connection,
    /// if the peer sends an unknown route or disconnects mid-stream.
    pub async fn serve_connection<S>(&self, stream: S) -> anyhow::Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        let Some(first) = framed.next().await else {
            return Ok(());
        };
        let first = first?;
        let frame: WireFrame = bincode::deserialize(&first)?;
        let Some(factory) = self.routes.get(&frame.route) else {
            anyhow::bail!("unknown control channel route `{}`", frame.route);
        };
        let mut handler = factory();
        handler.on_frame(Bytes::from(frame.payload))?;

        while let Some(bytes) = framed.next().await {
            let bytes = bytes?;
            let frame: WireFrame = bincode::deserialize(&bytes)?;
            handler.on_frame(Bytes::from(frame.payload))?;
        }
        Ok(())
    }

    /// Encodes one outgoing frame for `route` with `payload`, ready to be
    /// written to a `Framed<_, LengthDelimitedCodec>` sink.
    pub fn encode(route: &str, payload: &[u8]) -> anyhow::Result<BytesMut> {
        let frame = WireFrame {
            route: route.to_string(),
            payload: payload.to_vec(),
        };
        Ok(BytesMut::from(bincode::serialize(&frame)?.as_slice()))
    }

    /// Sends one frame on an already-framed sink, e.g. from a worker dialing
    /// the master's `log` route.
    pub async fn send_frame<S>(
        framed: &mut Framed<S, LengthDelimitedCodec>,
        route: &str,
        payload: &[u8],
    ) -> anyhow::Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let encoded = Self::encode(route, payload)?;
        framed.send(encoded.freeze()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::duplex;

    struct RecordingHandler {
        seen: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RouteHandler for RecordingHandler {
        fn on_frame(&mut self, payload: Bytes) -> anyhow::Result<()> {
            #[allow(clippy::unwrap_used)]
            self.seen.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_frames_to_the_declared_route() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let channel = ControlChannelBuilder::new()
            .with_route(Route::new("log", move || {
                Box::new(RecordingHandler {
                    seen: seen_clone.clone(),
                })
            }))
            .build();

        let (client, server) = duplex(4096);
        let mut client_framed = Framed::new(client, LengthDelimitedCodec::new());

        let server_task = tokio::spawn(async move { channel.serve_connection(server).await });

        ControlChannel::send_frame(&mut client_framed, "log", b"line one")
            .await
            .unwrap();
        ControlChannel::send_frame(&mut client_framed, "log", b"line two")
            .await
            .unwrap();
        drop(client_framed);

        server_task.await.unwrap().unwrap();
        #[allow(clippy::unwrap_used)]
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], b"line one");
        assert_eq!(seen[1], b"line two");
    }

    #[tokio::test]
    async fn unknown_route_closes_only_that_connection() {
        let channel = ControlChannelBuilder::new().build();
        let (client, server) = duplex(4096);
        let mut client_framed = Framed::new(client, LengthDelimitedCodec::new());
        let server_task = tokio::spawn(async move { channel.serve_connection(server).await });
        ControlChannel::send_frame(&mut client_framed, "nope", b"x")
            .await
            .unwrap();
        let result = server_task.await.unwrap();
        assert!(result.is_err());
    }
}
