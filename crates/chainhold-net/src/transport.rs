//! Transport abstraction
//!
//! The node core only needs to send one-way messages, issue request/response
//! calls to a specific peer, and receive inbound traffic as events. Delivery
//! is not assumed to be reliable and peers may vanish at any time.

use crate::framing::FrameError;
use crate::message::WireMessage;
use crate::peer::{PeerId, PeerInfo};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(PeerId),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Request timed out")]
    Timeout,
    #[error("Transport closed")]
    Closed,
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Handle for answering an inbound request
pub struct ReplyHandle(oneshot::Sender<WireMessage>);

impl ReplyHandle {
    pub fn new(tx: oneshot::Sender<WireMessage>) -> Self {
        Self(tx)
    }

    /// Send the response. The requester may have given up already; that is not an error.
    pub fn send(self, message: WireMessage) {
        let _ = self.0.send(message);
    }
}

impl std::fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReplyHandle")
    }
}

/// Event from the transport layer
#[derive(Debug)]
pub enum TransportEvent {
    /// Handshake with a peer completed
    PeerConnected(PeerInfo),
    /// Connection to a peer was lost or closed
    PeerDisconnected(PeerId),
    /// Message received from a peer; `reply` is set for requests
    Message {
        from: PeerId,
        message: WireMessage,
        reply: Option<ReplyHandle>,
    },
}

/// Receiving side of a transport's event stream
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Network operations used by a node.
///
/// Implemented by [`crate::MemoryTransport`] for in-process simulation and
/// by [`crate::TcpTransport`] for real sockets.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Our own peer id
    fn local_id(&self) -> PeerId;

    /// Send a one-way message
    async fn send(&self, to: PeerId, message: WireMessage) -> Result<(), TransportError>;

    /// Send a request and wait for the response
    async fn request(
        &self,
        to: PeerId,
        message: WireMessage,
        timeout: Duration,
    ) -> Result<WireMessage, TransportError>;

    /// Disconnect from every peer; later calls fail with `Closed`
    async fn close(&self);
}
