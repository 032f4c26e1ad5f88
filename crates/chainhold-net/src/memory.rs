//! In-process simulated network
//!
//! Every attached peer gets its own event channel; there is no memory shared
//! between peers beyond the routing table of who is currently attached.
//! Attaching performs the handshake in both directions, detaching tells every
//! remaining peer that the departed one is gone.

use crate::message::WireMessage;
use crate::peer::{PeerId, PeerInfo};
use crate::transport::{EventReceiver, ReplyHandle, Transport, TransportError, TransportEvent};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Routes = Arc<RwLock<HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>>>;

/// Simulated network connecting in-process peers
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    routes: Routes,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer. Existing peers see it connect, and it sees them.
    pub fn attach(&self, id: PeerId) -> (Arc<MemoryTransport>, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut routes = self.routes.write();
        if let Some(old) = routes.remove(&id) {
            debug!(peer = %id, "replacing stale attachment");
            drop(old);
        }
        for (other, other_tx) in routes.iter() {
            let _ = other_tx.send(TransportEvent::PeerConnected(PeerInfo::new(id, None)));
            let _ = tx.send(TransportEvent::PeerConnected(PeerInfo::new(*other, None)));
        }
        routes.insert(id, tx);
        drop(routes);

        debug!(peer = %id, "attached to memory network");
        let transport = Arc::new(MemoryTransport {
            id,
            routes: self.routes.clone(),
            closed: AtomicBool::new(false),
        });
        (transport, rx)
    }

    /// Detach a peer. Remaining peers see it disconnect.
    pub fn detach(&self, id: &PeerId) {
        detach(&self.routes, id);
    }

    /// Currently attached peers
    pub fn peers(&self) -> Vec<PeerId> {
        self.routes.read().keys().copied().collect()
    }

    pub fn is_attached(&self, id: &PeerId) -> bool {
        self.routes.read().contains_key(id)
    }
}

fn detach(routes: &Routes, id: &PeerId) {
    let mut routes = routes.write();
    if routes.remove(id).is_none() {
        return;
    }
    for other_tx in routes.values() {
        let _ = other_tx.send(TransportEvent::PeerDisconnected(*id));
    }
    debug!(peer = %id, "detached from memory network");
}

/// One peer's view of a [`MemoryNetwork`]
pub struct MemoryTransport {
    id: PeerId,
    routes: Routes,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn route(&self, to: &PeerId) -> Result<mpsc::UnboundedSender<TransportEvent>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let routes = self.routes.read();
        if !routes.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        routes
            .get(to)
            .cloned()
            .ok_or(TransportError::PeerUnreachable(*to))
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> PeerId {
        self.id
    }

    async fn send(&self, to: PeerId, message: WireMessage) -> Result<(), TransportError> {
        let tx = self.route(&to)?;
        tx.send(TransportEvent::Message {
            from: self.id,
            message,
            reply: None,
        })
        .map_err(|_| TransportError::PeerUnreachable(to))
    }

    async fn request(
        &self,
        to: PeerId,
        message: WireMessage,
        timeout: Duration,
    ) -> Result<WireMessage, TransportError> {
        let tx = self.route(&to)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(TransportEvent::Message {
            from: self.id,
            message,
            reply: Some(ReplyHandle::new(reply_tx)),
        })
        .map_err(|_| TransportError::PeerUnreachable(to))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            // Responder dropped the reply handle: it went away mid-request
            Ok(Err(_)) => Err(TransportError::PeerUnreachable(to)),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            detach(&self.routes, &self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    #[tokio::test]
    async fn test_attach_announces_both_ways() {
        let net = MemoryNetwork::new();
        let (_a, mut a_rx) = net.attach(peer(1));
        let (_b, mut b_rx) = net.attach(peer(2));

        match a_rx.recv().await.unwrap() {
            TransportEvent::PeerConnected(info) => assert_eq!(info.id, peer(2)),
            other => panic!("unexpected {:?}", other),
        }
        match b_rx.recv().await.unwrap() {
            TransportEvent::PeerConnected(info) => assert_eq!(info.id, peer(1)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_response() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.attach(peer(1));
        let (_b, mut b_rx) = net.attach(peer(2));

        tokio::spawn(async move {
            while let Some(event) = b_rx.recv().await {
                if let TransportEvent::Message {
                    message: WireMessage::Ping,
                    reply: Some(reply),
                    ..
                } = event
                {
                    reply.send(WireMessage::Pong);
                }
            }
        });

        let response = a
            .request(peer(2), WireMessage::Ping, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, WireMessage::Pong);
    }

    #[tokio::test]
    async fn test_detached_peer_unreachable() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = net.attach(peer(1));
        let (b, _b_rx) = net.attach(peer(2));
        let _ = a_rx.recv().await;

        b.close().await;
        assert!(!net.is_attached(&peer(2)));
        match a_rx.recv().await.unwrap() {
            TransportEvent::PeerDisconnected(id) => assert_eq!(id, peer(2)),
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            a.send(peer(2), WireMessage::Ping).await,
            Err(TransportError::PeerUnreachable(_))
        ));
        assert!(matches!(
            b.send(peer(1), WireMessage::Ping).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_request_to_silent_peer_times_out() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.attach(peer(1));
        let (_b, _b_rx) = net.attach(peer(2));

        let result = a
            .request(peer(2), WireMessage::Ping, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }
}
