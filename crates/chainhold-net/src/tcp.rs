//! TCP transport
//!
//! One framed TCP connection per peer. Both sides open with a `Hello` frame
//! carrying their [`PeerInfo`]; afterwards frames are one-way messages or
//! request/response pairs correlated by a request id.

use crate::framing::{Frame, FrameCodec, FrameType};
use crate::message::{hello_frame, parse_hello, WireMessage};
use crate::peer::{PeerId, PeerInfo};
use crate::transport::{EventReceiver, ReplyHandle, Transport, TransportError, TransportEvent};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// How long a handshake may take before the connection is dropped
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Outbound frame queue per connection
const SEND_QUEUE: usize = 256;

/// Connection to a peer
struct Connection {
    peer: PeerInfo,
    tx: mpsc::Sender<Frame>,
    open: AtomicBool,
}

impl Connection {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

/// Transport over plain TCP sockets
pub struct TcpTransport {
    local: PeerInfo,
    connections: RwLock<HashMap<PeerId, Arc<Connection>>>,
    /// Waiters keyed by the peer asked and the request id
    pending: Mutex<HashMap<(PeerId, u64), oneshot::Sender<WireMessage>>>,
    next_request_id: AtomicU64,
    events: mpsc::UnboundedSender<TransportEvent>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Bind a listener and start accepting connections
    pub async fn bind(
        local_id: PeerId,
        listen: SocketAddr,
    ) -> Result<(Arc<Self>, EventReceiver), TransportError> {
        let listener = TcpListener::bind(listen).await?;
        let listen_addr = listener.local_addr()?;
        let (events, rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            local: PeerInfo::new(local_id, Some(listen_addr)),
            connections: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            events,
            accept_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        info!("Transport listening on {}", listen_addr);
        let accept = tokio::spawn(transport.clone().accept_loop(listener));
        *transport.accept_task.lock() = Some(accept);

        Ok((transport, rx))
    }

    /// Address we accept connections on
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.local.listen_addr
    }

    /// List connected peers
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.read().keys().copied().collect()
    }

    /// Dial a peer and complete the handshake
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, FrameCodec::new());

        framed.send(hello_frame(&self.local)?).await?;
        let mut peer = read_hello(&mut framed).await?;
        if peer.listen_addr.is_none() {
            peer.listen_addr = Some(addr);
        }
        let peer_id = peer.id;
        self.register(peer, framed);
        Ok(peer_id)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept error: {}", e);
                    continue;
                }
            };
            debug!("Accepted connection from {}", addr);

            let transport = self.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, FrameCodec::new());
                let peer = match read_hello(&mut framed).await {
                    Ok(peer) => peer,
                    Err(e) => {
                        warn!("Handshake with {} failed: {}", addr, e);
                        return;
                    }
                };
                let hello = match hello_frame(&transport.local) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Cannot encode hello: {}", e);
                        return;
                    }
                };
                if let Err(e) = framed.send(hello).await {
                    warn!("Handshake with {} failed: {}", addr, e);
                    return;
                }
                transport.register(peer, framed);
            });
        }
    }

    /// Install a handshaken connection and spawn its reader and writer
    fn register(self: &Arc<Self>, peer: PeerInfo, framed: Framed<TcpStream, FrameCodec>) {
        if peer.id == self.local.id {
            debug!("Dropping connection to ourselves");
            return;
        }
        let (tx, mut rx) = mpsc::channel::<Frame>(SEND_QUEUE);
        let connection = Arc::new(Connection {
            peer: peer.clone(),
            tx,
            open: AtomicBool::new(true),
        });

        {
            let mut connections = self.connections.write();
            if connections.contains_key(&peer.id) {
                debug!(peer = %peer.id, "already connected, dropping duplicate");
                return;
            }
            connections.insert(peer.id, connection.clone());
        }
        info!(peer = %peer.id, addr = ?peer.listen_addr, "peer connected");
        let _ = self.events.send(TransportEvent::PeerConnected(peer.clone()));

        let (mut sink, mut stream) = framed.split();

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let goodbye = frame.frame_type == FrameType::Goodbye;
                if sink.send(frame).await.is_err() || goodbye {
                    break;
                }
            }
        });

        let transport = self.clone();
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                let frame = match result {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(peer = %peer.id, "frame error: {}", e);
                        break;
                    }
                };
                if !transport.handle_frame(&connection, frame) {
                    break;
                }
            }
            transport.drop_connection(&connection);
        });
    }

    /// Returns false when the connection should be closed
    fn handle_frame(&self, connection: &Arc<Connection>, frame: Frame) -> bool {
        let from = connection.peer.id;
        match frame.frame_type {
            FrameType::Ping => {
                let _ = connection.tx.try_send(Frame::pong());
            }
            FrameType::Pong => {}
            FrameType::Hello => debug!(peer = %from, "ignoring repeated hello"),
            FrameType::Goodbye => return false,
            FrameType::Oneway => match WireMessage::decode(&frame.payload) {
                Ok(message) => {
                    let _ = self.events.send(TransportEvent::Message {
                        from,
                        message,
                        reply: None,
                    });
                }
                Err(e) => warn!(peer = %from, "bad one-way message: {}", e),
            },
            FrameType::Request => {
                let decoded = frame
                    .split_correlated()
                    .and_then(|(id, body)| Ok((id, WireMessage::decode(body)?)));
                let (request_id, message) = match decoded {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!(peer = %from, "bad request: {}", e);
                        return true;
                    }
                };
                let (reply_tx, reply_rx) = oneshot::channel();
                let _ = self.events.send(TransportEvent::Message {
                    from,
                    message,
                    reply: Some(ReplyHandle::new(reply_tx)),
                });
                let connection = connection.clone();
                tokio::spawn(async move {
                    let Ok(response) = reply_rx.await else { return };
                    match response.to_response_frame(request_id) {
                        Ok(frame) => {
                            let _ = connection.send(frame).await;
                        }
                        Err(e) => warn!("cannot encode response: {}", e),
                    }
                });
            }
            FrameType::Response => {
                let decoded = frame
                    .split_correlated()
                    .and_then(|(id, body)| Ok((id, WireMessage::decode(body)?)));
                match decoded {
                    Ok((request_id, message)) => {
                        // Only the connection the request went out on may answer it
                        if let Some(waiter) = self.pending.lock().remove(&(from, request_id)) {
                            let _ = waiter.send(message);
                        }
                    }
                    Err(e) => warn!(peer = %from, "bad response: {}", e),
                }
            }
        }
        true
    }

    fn drop_connection(&self, connection: &Arc<Connection>) {
        connection.open.store(false, Ordering::Release);
        let removed = {
            let mut connections = self.connections.write();
            match connections.get(&connection.peer.id) {
                Some(current) if Arc::ptr_eq(current, connection) => {
                    connections.remove(&connection.peer.id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            info!(peer = %connection.peer.id, "peer disconnected");
            let _ = self
                .events
                .send(TransportEvent::PeerDisconnected(connection.peer.id));
        }
    }

    fn connection(&self, to: &PeerId) -> Result<Arc<Connection>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.connections
            .read()
            .get(to)
            .cloned()
            .ok_or(TransportError::PeerUnreachable(*to))
    }
}

async fn read_hello(framed: &mut Framed<TcpStream, FrameCodec>) -> Result<PeerInfo, TransportError> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(frame))) => Ok(parse_hello(&frame)?),
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(None) => Err(TransportError::ConnectionClosed),
        Err(_) => Err(TransportError::Handshake("timed out waiting for hello".into())),
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn local_id(&self) -> PeerId {
        self.local.id
    }

    async fn send(&self, to: PeerId, message: WireMessage) -> Result<(), TransportError> {
        let connection = self.connection(&to)?;
        connection.send(message.to_oneway_frame()?).await
    }

    async fn request(
        &self,
        to: PeerId,
        message: WireMessage,
        timeout: Duration,
    ) -> Result<WireMessage, TransportError> {
        let connection = self.connection(&to)?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = message.to_request_frame(request_id)?;

        let key = (to, request_id);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key, tx);
        if let Err(e) = connection.send(frame).await {
            self.pending.lock().remove(&key);
            return Err(e);
        }

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.lock().remove(&key);
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(accept) = self.accept_task.lock().take() {
            accept.abort();
        }
        let connections: Vec<_> = self.connections.write().drain().map(|(_, c)| c).collect();
        for connection in connections {
            let _ = connection.send(Frame::goodbye()).await;
            connection.open.store(false, Ordering::Release);
        }
        self.pending.lock().clear();
        info!("Transport closed");
    }
}
