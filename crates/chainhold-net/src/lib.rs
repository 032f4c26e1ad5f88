//! Networking primitives for chainhold peers
//!
//! This crate provides:
//! - Agent keypair management
//! - Message framing and the wire protocol
//! - The [`Transport`] abstraction, with an in-process simulated network and
//!   a TCP implementation

pub mod crypto;
pub mod framing;
pub mod memory;
pub mod message;
pub mod peer;
pub mod tcp;
pub mod transport;

pub use crypto::KeyPair;
pub use framing::{Frame, FrameCodec, FrameType};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::WireMessage;
pub use peer::{PeerId, PeerInfo};
pub use tcp::TcpTransport;
pub use transport::{EventReceiver, ReplyHandle, Transport, TransportError, TransportEvent};
