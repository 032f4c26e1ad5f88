//! Peer identity and information

use chainhold_core::AgentKey;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Unique peer identifier (the agent's public key)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Create from public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*public_key)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The author key this peer signs its chain with
    pub fn agent_key(&self) -> AgentKey {
        AgentKey(self.0)
    }
}

impl From<AgentKey> for PeerId {
    fn from(key: AgentKey) -> Self {
        Self(key.0)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Information about a peer, as learned from a handshake
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Address the peer accepts connections on, if any
    pub listen_addr: Option<SocketAddr>,
    /// Last seen timestamp (unix millis)
    pub last_seen: u64,
}

impl PeerInfo {
    /// Create new peer info
    pub fn new(id: PeerId, listen_addr: Option<SocketAddr>) -> Self {
        let mut info = Self {
            id,
            listen_addr,
            last_seen: 0,
        };
        info.touch();
        info
    }

    /// Update last seen time
    pub fn touch(&mut self) {
        self.last_seen = unix_millis();
    }
}

/// Current wall-clock time in unix millis.
pub fn unix_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
