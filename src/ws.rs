//! Salvo WebSocket glue: a `Transport` impl over salvo's `WebSocket`, and
//! the upgrade handler that builds a [`Session`] and drives it.
//!
//! Contains no protocol logic of its own — everything about frames,
//! handshake, and dispatch lives in [`crate::session`]. This module's only
//! job is turning an HTTP upgrade request into one live [`Transport`].

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use salvo::prelude::*;
use salvo::websocket::{Message, WebSocket, WebSocketUpgrade};
use tokio::sync::Mutex;

use crate::app;
use crate::session::Session;
use crate::transport::{self, ConnectionClosed, Transport};

pub struct WebSocketTransport {
    id: u64,
    remote_addr: Option<String>,
    sink: Mutex<futures::stream::SplitSink<WebSocket, Message>>,
    stream: Mutex<futures::stream::SplitStream<WebSocket>>,
}

impl WebSocketTransport {
    fn new(ws: WebSocket, remote_addr: Option<String>) -> Arc<Self> {
        let (sink, stream) = ws.split();
        Arc::new(Self {
            id: transport::next_transport_id(),
            remote_addr,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, data: Vec<u8>) -> Result<(), ConnectionClosed> {
        self.sink.lock().await.send(Message::binary(data)).await.map_err(|_| ConnectionClosed)
    }

    async fn receive(&self) -> Result<Vec<u8>, ConnectionClosed> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                None => return Err(ConnectionClosed),
                Some(Err(_)) => return Err(ConnectionClosed),
                Some(Ok(msg)) => {
                    if msg.is_close() {
                        return Err(ConnectionClosed);
                    }
                    if msg.is_binary() {
                        return Ok(msg.as_bytes().to_vec());
                    }
                    // Text/ping/pong frames carry no protocol meaning here; keep reading.
                }
            }
        }
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn id(&self) -> u64 {
        self.id
    }
}

/// Mounted at `config.ws_path`. Upgrades the connection, wraps it as a
/// [`WebSocketTransport`], and drives a fresh [`Session`] to completion.
#[handler]
pub async fn ws_upgrade(req: &mut Request, res: &mut Response) -> Result<(), StatusError> {
    let app = app::get();
    let remote_addr = Some(req.remote_addr().to_string());

    WebSocketUpgrade::new()
        .upgrade(req, res, move |ws| async move {
            let transport = WebSocketTransport::new(ws, remote_addr) as Arc<dyn Transport>;
            let session = Session::new(transport, app.registry.clone(), app.connections.clone(), app.limiter.clone());
            session.run().await;
        })
        .await
}
