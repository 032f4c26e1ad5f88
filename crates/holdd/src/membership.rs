//! Peer membership and reachability tracking

use chainhold_net::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Membership errors
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Not joined to the network")]
    NotJoined,
    #[error("Refusing to track ourselves")]
    SelfPeer,
}

/// Reachability of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Never seen
    Unknown,
    /// Handshake completed, connection up
    Online,
    /// Connection lost, left, or too many failed calls
    Offline,
}

/// What we know about one peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub status: PeerStatus,
    /// Last-known listen address
    pub addr: Option<SocketAddr>,
    pub first_seen: Instant,
    /// Start of the current session, if online
    pub connected_at: Option<Instant>,
    pub last_seen: Instant,
    /// Consecutive failed calls
    pub failures: u32,
    /// Times this peer came online
    pub sessions: u32,
    /// Offline because calls kept failing while the connection stayed up
    pub failed_out: bool,
}

/// Status transitions visible to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    PeerOnline(PeerId),
    PeerOffline(PeerId),
}

/// Tracks which peers are currently reachable.
///
/// Owned by one node. Records are kept after a peer goes offline.
pub struct MembershipTracker {
    local_id: PeerId,
    joined: AtomicBool,
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    events: broadcast::Sender<MembershipEvent>,
    max_failures: u32,
}

impl MembershipTracker {
    pub fn new(local_id: PeerId, max_failures: u32) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            local_id,
            joined: AtomicBool::new(false),
            peers: RwLock::new(HashMap::new()),
            events,
            max_failures: max_failures.max(1),
        }
    }

    /// Start accepting peers
    pub fn join(&self) {
        if !self.joined.swap(true, Ordering::AcqRel) {
            info!(peer = %self.local_id, "joined network");
        }
    }

    /// Stop accepting peers and mark everyone offline
    pub fn leave(&self) {
        if !self.joined.swap(false, Ordering::AcqRel) {
            return;
        }
        let online: Vec<PeerId> = self
            .peers
            .read()
            .values()
            .filter(|r| r.status == PeerStatus::Online)
            .map(|r| r.peer_id)
            .collect();
        for peer in online {
            self.peer_offline(&peer);
        }
        info!(peer = %self.local_id, "left network");
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }

    /// Handshake with a peer completed. Returns true on a transition to online.
    pub fn peer_online(&self, peer: PeerId, addr: Option<SocketAddr>) -> Result<bool, MembershipError> {
        if !self.is_joined() {
            return Err(MembershipError::NotJoined);
        }
        if peer == self.local_id {
            return Err(MembershipError::SelfPeer);
        }

        let now = Instant::now();
        let mut peers = self.peers.write();
        let record = peers.entry(peer).or_insert_with(|| PeerRecord {
            peer_id: peer,
            status: PeerStatus::Unknown,
            addr: None,
            first_seen: now,
            connected_at: None,
            last_seen: now,
            failures: 0,
            sessions: 0,
            failed_out: false,
        });
        if addr.is_some() {
            record.addr = addr;
        }
        record.last_seen = now;
        record.failures = 0;
        record.failed_out = false;

        if record.status == PeerStatus::Online {
            return Ok(false);
        }
        Self::bring_online(record, now);
        drop(peers);

        debug!(peer = %peer, "peer online");
        let _ = self.events.send(MembershipEvent::PeerOnline(peer));
        Ok(true)
    }

    fn bring_online(record: &mut PeerRecord, now: Instant) {
        record.status = PeerStatus::Online;
        record.connected_at = Some(now);
        record.sessions += 1;
    }

    /// Connection to a peer lost. Returns true on a transition to offline.
    pub fn peer_offline(&self, peer: &PeerId) -> bool {
        self.go_offline(peer, false)
    }

    fn go_offline(&self, peer: &PeerId, failed_out: bool) -> bool {
        let mut peers = self.peers.write();
        let Some(record) = peers.get_mut(peer) else {
            return false;
        };
        if record.status != PeerStatus::Online {
            if !failed_out {
                // A real disconnect overrides an earlier failure verdict
                record.failed_out = false;
            }
            return false;
        }
        record.status = PeerStatus::Offline;
        record.connected_at = None;
        record.failed_out = failed_out;
        drop(peers);

        debug!(peer = %peer, failed_out, "peer offline");
        let _ = self.events.send(MembershipEvent::PeerOffline(*peer));
        true
    }

    /// A call to the peer failed. Returns true if that took it offline.
    pub fn record_failure(&self, peer: &PeerId) -> bool {
        let exhausted = {
            let mut peers = self.peers.write();
            match peers.get_mut(peer) {
                Some(record) => {
                    record.failures += 1;
                    record.failures >= self.max_failures
                }
                None => false,
            }
        };
        exhausted && self.go_offline(peer, true)
    }

    /// Traffic from the peer arrived or a call succeeded. A peer that was
    /// only taken offline by failed calls is online again; returns true
    /// on that transition.
    pub fn record_seen(&self, peer: &PeerId) -> bool {
        let now = Instant::now();
        let mut peers = self.peers.write();
        let Some(record) = peers.get_mut(peer) else {
            return false;
        };
        record.last_seen = now;
        record.failures = 0;

        let revive = self.is_joined() && record.status == PeerStatus::Offline && record.failed_out;
        if !revive {
            return false;
        }
        record.failed_out = false;
        Self::bring_online(record, now);
        drop(peers);

        debug!(peer = %peer, "peer reachable again");
        let _ = self.events.send(MembershipEvent::PeerOnline(*peer));
        true
    }

    pub fn status(&self, peer: &PeerId) -> PeerStatus {
        self.peers
            .read()
            .get(peer)
            .map(|r| r.status)
            .unwrap_or(PeerStatus::Unknown)
    }

    pub fn record(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.peers.read().get(peer).cloned()
    }

    pub fn is_reachable(&self, peer: &PeerId) -> bool {
        self.is_joined() && self.status(peer) == PeerStatus::Online
    }

    /// Peers currently online
    pub fn reachable_peers(&self) -> Vec<PeerId> {
        if !self.is_joined() {
            return Vec::new();
        }
        self.peers
            .read()
            .values()
            .filter(|r| r.status == PeerStatus::Online)
            .map(|r| r.peer_id)
            .collect()
    }

    /// Watch status transitions
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> MembershipStats {
        let peers = self.peers.read();
        MembershipStats {
            known: peers.len(),
            online: peers
                .values()
                .filter(|r| r.status == PeerStatus::Online)
                .count(),
            offline: peers
                .values()
                .filter(|r| r.status == PeerStatus::Offline)
                .count(),
        }
    }
}

/// Membership statistics
#[derive(Debug, Clone)]
pub struct MembershipStats {
    pub known: usize,
    pub online: usize,
    pub offline: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    fn joined() -> MembershipTracker {
        let tracker = MembershipTracker::new(peer(0), 3);
        tracker.join();
        tracker
    }

    #[test]
    fn test_lifecycle() {
        let tracker = joined();
        assert_eq!(tracker.status(&peer(1)), PeerStatus::Unknown);

        assert!(tracker.peer_online(peer(1), None).unwrap());
        assert!(!tracker.peer_online(peer(1), None).unwrap());
        assert_eq!(tracker.reachable_peers(), vec![peer(1)]);

        assert!(tracker.peer_offline(&peer(1)));
        assert!(!tracker.peer_offline(&peer(1)));
        assert_eq!(tracker.status(&peer(1)), PeerStatus::Offline);
        assert!(tracker.reachable_peers().is_empty());

        // Reconnect
        assert!(tracker.peer_online(peer(1), None).unwrap());
        assert_eq!(tracker.record(&peer(1)).unwrap().sessions, 2);
    }

    #[test]
    fn test_requires_join() {
        let tracker = MembershipTracker::new(peer(0), 3);
        assert!(matches!(
            tracker.peer_online(peer(1), None),
            Err(MembershipError::NotJoined)
        ));
        tracker.join();
        assert!(matches!(
            tracker.peer_online(peer(0), None),
            Err(MembershipError::SelfPeer)
        ));
    }

    #[test]
    fn test_failures_take_peer_offline() {
        let tracker = joined();
        tracker.peer_online(peer(2), None).unwrap();

        assert!(!tracker.record_failure(&peer(2)));
        tracker.record_seen(&peer(2));
        assert!(!tracker.record_failure(&peer(2)));
        assert!(!tracker.record_failure(&peer(2)));
        assert!(tracker.record_failure(&peer(2)));
        assert_eq!(tracker.status(&peer(2)), PeerStatus::Offline);
    }

    #[test]
    fn test_traffic_revives_peer_taken_offline_by_failures() {
        let tracker = joined();
        let mut events = tracker.subscribe();
        tracker.peer_online(peer(2), None).unwrap();

        for _ in 0..3 {
            tracker.record_failure(&peer(2));
        }
        assert_eq!(tracker.status(&peer(2)), PeerStatus::Offline);
        assert!(tracker.reachable_peers().is_empty());

        assert!(tracker.record_seen(&peer(2)));
        assert_eq!(tracker.status(&peer(2)), PeerStatus::Online);
        assert_eq!(tracker.reachable_peers(), vec![peer(2)]);
        assert!(!tracker.record_seen(&peer(2)));
        assert_eq!(tracker.record(&peer(2)).unwrap().sessions, 2);

        let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(
            seen,
            vec![
                MembershipEvent::PeerOnline(peer(2)),
                MembershipEvent::PeerOffline(peer(2)),
                MembershipEvent::PeerOnline(peer(2)),
            ]
        );
    }

    #[test]
    fn test_traffic_does_not_revive_disconnected_peer() {
        let tracker = joined();
        tracker.peer_online(peer(3), None).unwrap();
        tracker.peer_offline(&peer(3));

        assert!(!tracker.record_seen(&peer(3)));
        assert_eq!(tracker.status(&peer(3)), PeerStatus::Offline);

        // Failed out, then the connection drops for real
        tracker.peer_online(peer(3), None).unwrap();
        for _ in 0..3 {
            tracker.record_failure(&peer(3));
        }
        tracker.peer_offline(&peer(3));
        assert!(!tracker.record_seen(&peer(3)));
        assert_eq!(tracker.status(&peer(3)), PeerStatus::Offline);
    }

    #[test]
    fn test_leave_keeps_records() {
        let tracker = joined();
        tracker.peer_online(peer(1), None).unwrap();
        tracker.peer_online(peer(2), None).unwrap();

        tracker.leave();
        let stats = tracker.stats();
        assert_eq!(stats.known, 2);
        assert_eq!(stats.online, 0);
        assert_eq!(stats.offline, 2);
        assert!(!tracker.is_reachable(&peer(1)));
    }

    #[tokio::test]
    async fn test_subscribe_sees_transitions() {
        let tracker = joined();
        let mut events = tracker.subscribe();

        tracker.peer_online(peer(1), None).unwrap();
        tracker.peer_online(peer(1), None).unwrap();
        tracker.peer_offline(&peer(1));

        assert_eq!(events.recv().await.unwrap(), MembershipEvent::PeerOnline(peer(1)));
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::PeerOffline(peer(1)));
        assert!(events.try_recv().is_err());
    }
}
