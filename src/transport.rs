//! The byte-framed full-duplex channel a [`crate::session::Session`] drives.
//!
//! `Transport` is intentionally narrow: `send`/`receive`/`remote_addr`, plus
//! a stable `id()` the connection manager uses to tell two transports apart
//! even when a user holds several concurrent connections. Frames are opaque
//! bytes here — encoding/decoding them is [`crate::codec`]'s job.

use std::sync::atomic::{AtomicU64, Ordering};

use salvo::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Raised by `send`/`receive` when the peer has gone away. Not a protocol
/// error — it's the session's cue to clean up and stop.
#[derive(Debug, Error, Clone, Copy)]
#[error("connection closed")]
pub struct ConnectionClosed;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame's worth of bytes. Must be safe to call concurrently
    /// from multiple tasks (reply tasks, `emit`, broadcast fan-out all race
    /// to write); implementations that wrap a non-concurrency-safe sink
    /// must serialize internally.
    async fn send(&self, data: Vec<u8>) -> Result<(), ConnectionClosed>;

    /// Block until one whole frame arrives.
    async fn receive(&self) -> Result<Vec<u8>, ConnectionClosed>;

    fn remote_addr(&self) -> Option<String>;

    /// Stable per-connection identity. Two `Arc<dyn Transport>` handles
    /// wrapping the same underlying connection must return the same id;
    /// this is what lets the connection manager remove *this* transport on
    /// session end without disturbing a different concurrent session for
    /// the same user.
    fn id(&self) -> u64;
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_transport_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// An in-process, channel-backed transport pair used by tests (and usable
/// as a loopback transport for any host that isn't WebSocket).
pub struct ChannelTransport {
    id: u64,
    remote_addr: Option<String>,
    to_peer: mpsc::UnboundedSender<Vec<u8>>,
    from_peer: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// The far end of a [`ChannelTransport`] pair, held by a test harness to
/// feed frames in and observe frames out.
pub struct ChannelTestPeer {
    pub to_transport: mpsc::UnboundedSender<Vec<u8>>,
    pub from_transport: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChannelTransport {
    /// Build a connected pair: `(transport, peer)`. Bytes sent via
    /// `peer.to_transport` arrive from `transport.receive()`, and bytes
    /// sent via `transport.send()` arrive on `peer.from_transport`.
    pub fn pair() -> (std::sync::Arc<Self>, ChannelTestPeer) {
        let (to_transport_tx, to_transport_rx) = mpsc::unbounded_channel();
        let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();

        let transport = std::sync::Arc::new(Self {
            id: next_transport_id(),
            remote_addr: Some("127.0.0.1:0".into()),
            to_peer: to_peer_tx,
            from_peer: Mutex::new(to_transport_rx),
        });
        let peer = ChannelTestPeer {
            to_transport: to_transport_tx,
            from_transport: Mutex::new(to_peer_rx),
        };
        (transport, peer)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, data: Vec<u8>) -> Result<(), ConnectionClosed> {
        self.to_peer.send(data).map_err(|_| ConnectionClosed)
    }

    async fn receive(&self) -> Result<Vec<u8>, ConnectionClosed> {
        self.from_peer.lock().await.recv().await.ok_or(ConnectionClosed)
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn id(&self) -> u64 {
        self.id
    }
}
