//! Node façade: one peer's store, validation, membership and replication
//!
//! Reads are always served from the local store. Publishing appends to the
//! node's own chain and announces the new entry; everything else happens in
//! the background worker and transport event loop.

use crate::config::NodeConfig;
use crate::entry_store::{EntryStore, EntryStoreError};
use crate::membership::{MembershipError, MembershipStats, MembershipTracker};
use crate::storage::Storage;
use crate::sync::{GossipReplicator, ReplicatorStats, Work};
use crate::validation::{LocalOnly, RuleRegistry, ValidationEngine, ValidationFailure, Verdict};
use chainhold_core::crypto::{entry_address, header_address};
use chainhold_core::types::*;
use chainhold_net::crypto::CryptoError;
use chainhold_net::peer::unix_millis;
use chainhold_net::{EventReceiver, KeyPair, PeerId, Transport, TransportEvent};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Entry store error: {0}")]
    Store(#[from] EntryStoreError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Core error: {0}")]
    Core(#[from] chainhold_core::Error),
    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),
    #[error("Entry rejected: {0}")]
    Rejected(ValidationFailure),
    #[error("Own chain is missing seq {0}")]
    ChainIncomplete(u64),
    #[error("Transport identity {transport} does not match agent {agent}")]
    IdentityMismatch { transport: PeerId, agent: PeerId },
    #[error("Node has been killed")]
    Killed,
}

/// A running peer
pub struct Node {
    keypair: KeyPair,
    peer_id: PeerId,
    store: Arc<EntryStore>,
    engine: Arc<ValidationEngine>,
    membership: Arc<MembershipTracker>,
    replicator: Arc<GossipReplicator>,
    transport: Arc<dyn Transport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes appends to our own chain
    publish_lock: tokio::sync::Mutex<()>,
    killed: AtomicBool,
}

impl Node {
    /// Start a node: write the genesis entry if the chain is empty, join,
    /// and start the replicator and transport event loop.
    pub async fn spawn(
        config: NodeConfig,
        storage: Arc<Storage>,
        keypair: KeyPair,
        rules: RuleRegistry,
        transport: Arc<dyn Transport>,
        events: EventReceiver,
    ) -> Result<Arc<Self>, NodeError> {
        let peer_id = PeerId::from(keypair.agent_key());
        if transport.local_id() != peer_id {
            return Err(NodeError::IdentityMismatch {
                transport: transport.local_id(),
                agent: peer_id,
            });
        }

        let store = Arc::new(EntryStore::new(storage));
        let engine = Arc::new(ValidationEngine::new(
            store.clone(),
            Arc::new(rules),
            keypair.agent_key(),
        ));
        let membership = Arc::new(MembershipTracker::new(peer_id, config.max_failures));
        let (replicator, inbox) = GossipReplicator::new(
            store.clone(),
            engine.clone(),
            membership.clone(),
            transport.clone(),
            config.replicator_config(),
        );

        let node = Arc::new(Self {
            keypair,
            peer_id,
            store,
            engine,
            membership: membership.clone(),
            replicator: replicator.clone(),
            transport,
            tasks: Mutex::new(Vec::new()),
            publish_lock: tokio::sync::Mutex::new(()),
            killed: AtomicBool::new(false),
        });

        node.ensure_genesis().await?;
        membership.join();

        let worker = tokio::spawn(replicator.clone().run(inbox));
        let event_loop = tokio::spawn(Self::event_loop(membership, replicator, events));
        node.tasks.lock().extend([worker, event_loop]);

        info!(
            peer = %node.peer_id,
            entries = node.store.entry_count(),
            "node started"
        );
        Ok(node)
    }

    async fn event_loop(
        membership: Arc<MembershipTracker>,
        replicator: Arc<GossipReplicator>,
        mut events: EventReceiver,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::PeerConnected(info) => {
                    match membership.peer_online(info.id, info.listen_addr) {
                        Ok(true) => {
                            info!(peer = %info.id, "peer online");
                            replicator.peer_arrived(info.id);
                        }
                        Ok(false) => {}
                        Err(e) => debug!(peer = %info.id, "ignoring connection: {}", e),
                    }
                }
                TransportEvent::PeerDisconnected(peer) => {
                    if membership.peer_offline(&peer) {
                        info!(peer = %peer, "peer offline");
                        replicator.peer_departed(&peer);
                    }
                }
                TransportEvent::Message {
                    from,
                    message,
                    reply,
                } => replicator.handle_message(from, message, reply),
            }
        }
        debug!("transport event stream closed");
    }

    async fn ensure_genesis(&self) -> Result<(), NodeError> {
        let author = self.keypair.agent_key();
        if self.store.latest_header(&author)?.is_none() {
            let genesis = Entry::agent_id(&author);
            let address = self.publish(genesis.entry_type, genesis.content).await?;
            debug!(address = %address, "genesis entry written");
        }
        Ok(())
    }

    /// Append an entry to our own chain and announce it
    pub async fn publish(
        &self,
        entry_type: EntryType,
        content: impl Into<Vec<u8>>,
    ) -> Result<Address, NodeError> {
        self.ensure_alive()?;
        let _guard = self.publish_lock.lock().await;

        let entry = Entry::new(entry_type, content);
        let header = self.next_header(&entry)?;

        match self.engine.validate(&entry, &header, &LocalOnly).await? {
            Verdict::Valid { .. } => {}
            Verdict::Invalid(failure) => return Err(NodeError::Rejected(failure)),
            Verdict::Incomplete { missing_seq, .. } => {
                return Err(NodeError::ChainIncomplete(missing_seq))
            }
        }

        let appended = self.store.append(&entry, &header)?;
        info!(
            address = %appended.address,
            seq = header.seq(),
            entry_type = %entry.entry_type,
            "published"
        );
        self.replicator
            .enqueue(Work::Announce(vec![GossipItem::Entry { entry, header }]));
        Ok(appended.address)
    }

    /// Publish an application entry
    pub async fn publish_app(
        &self,
        type_name: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Result<Address, NodeError> {
        self.publish(EntryType::App(type_name.into()), content).await
    }

    fn next_header(&self, entry: &Entry) -> Result<Header, NodeError> {
        let author = self.keypair.agent_key();
        let (seq, prev_header) = match self.store.latest_header(&author)? {
            Some(last) => (last.seq() + 1, Some(header_address(&last.unsigned)?)),
            None => (0, None),
        };
        let unsigned = HeaderUnsigned {
            entry_type: entry.entry_type.clone(),
            entry_address: entry_address(entry)?,
            author,
            seq,
            prev_header,
            timestamp_ms: unix_millis(),
        };
        Ok(self.keypair.sign_header(unsigned)?)
    }

    /// Local lookup of a validated entry
    pub fn fetch(&self, address: &Address) -> Result<Option<Entry>, NodeError> {
        Ok(self.fetch_with_header(address)?.map(|(entry, _)| entry))
    }

    /// Local lookup of a validated entry with the header it was validated with
    pub fn fetch_with_header(&self, address: &Address) -> Result<Option<(Entry, Header)>, NodeError> {
        self.ensure_alive()?;
        Ok(self.store.get(address)?)
    }

    /// Our own chain in order
    pub fn own_chain(&self) -> Result<Vec<Header>, NodeError> {
        Ok(self.store.headers_by_author(&self.keypair.agent_key())?)
    }

    /// Addresses of every entry held as valid
    pub fn held_addresses(&self) -> Result<BTreeSet<Address>, NodeError> {
        Ok(self.store.held_addresses()?.into_iter().collect())
    }

    /// Tear the node down. Peers see it go offline once their transport
    /// notices; data already replicated elsewhere stays there.
    pub async fn kill(&self) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transport.close().await;
        self.membership.leave();
        if let Err(e) = self.store.flush() {
            warn!(peer = %self.peer_id, "flush on shutdown failed: {}", e);
        }
        info!(peer = %self.peer_id, "node killed");
    }

    pub fn is_alive(&self) -> bool {
        !self.killed.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> Result<(), NodeError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(NodeError::Killed)
        }
    }

    /// Outstanding gossip work; zero means the backlog is empty
    pub fn pending_work(&self) -> usize {
        if self.is_alive() {
            self.replicator.pending_work()
        } else {
            0
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn agent_key(&self) -> AgentKey {
        self.keypair.agent_key()
    }

    pub fn membership(&self) -> &Arc<MembershipTracker> {
        &self.membership
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            peer_id: self.peer_id,
            entry_count: self.store.entry_count(),
            header_count: self.store.header_count(),
            rejected_count: self.store.rejected_count(),
            membership: self.membership.stats(),
            replicator: self.replicator.stats(),
        }
    }
}

/// Node statistics
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub peer_id: PeerId,
    pub entry_count: usize,
    pub header_count: usize,
    pub rejected_count: usize,
    pub membership: MembershipStats,
    pub replicator: ReplicatorStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::PeerStatus;
    use chainhold_net::MemoryNetwork;
    use std::time::Duration;

    async fn spawn_node(net: &MemoryNetwork) -> Arc<Node> {
        let keypair = KeyPair::generate();
        let (transport, events) = net.attach(PeerId::from(keypair.agent_key()));
        Node::spawn(
            NodeConfig::test_config(),
            Arc::new(Storage::open_temporary().unwrap()),
            keypair,
            RuleRegistry::new(),
            transport,
            events,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_spawn_writes_genesis() {
        let net = MemoryNetwork::new();
        let node = spawn_node(&net).await;

        let chain = node.own_chain().unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].entry_type(), &EntryType::AgentId);

        let genesis = node.fetch(chain[0].entry_address()).unwrap().unwrap();
        assert_eq!(genesis.content, node.agent_key().0.to_vec());
        node.kill().await;
    }

    #[tokio::test]
    async fn test_publish_then_fetch() {
        let net = MemoryNetwork::new();
        let node = spawn_node(&net).await;

        let first = node.publish_app("note", "hello").await.unwrap();
        let second = node.publish_app("note", "world").await.unwrap();

        assert_eq!(node.fetch(&first).unwrap().unwrap().content, b"hello".to_vec());
        let (_, header) = node.fetch_with_header(&second).unwrap().unwrap();
        assert_eq!(header.seq(), 2);
        assert_eq!(node.own_chain().unwrap().len(), 3);
        assert_eq!(node.fetch(&Address([0; 32])).unwrap(), None);
        node.kill().await;
    }

    #[tokio::test]
    async fn test_second_agent_id_refused() {
        let net = MemoryNetwork::new();
        let node = spawn_node(&net).await;

        let result = node.publish(EntryType::AgentId, node.agent_key().0.to_vec()).await;
        assert!(result.is_err());
        assert_eq!(node.own_chain().unwrap().len(), 1);
        node.kill().await;
    }

    #[tokio::test]
    async fn test_identity_mismatch() {
        let net = MemoryNetwork::new();
        let (transport, events) = net.attach(PeerId([9; 32]));
        let result = Node::spawn(
            NodeConfig::test_config(),
            Arc::new(Storage::open_temporary().unwrap()),
            KeyPair::generate(),
            RuleRegistry::new(),
            transport,
            events,
        )
        .await;
        assert!(matches!(result, Err(NodeError::IdentityMismatch { .. })));
    }

    #[tokio::test]
    async fn test_kill_marks_offline_at_peers() {
        let net = MemoryNetwork::new();
        let a = spawn_node(&net).await;
        let b = spawn_node(&net).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while b.membership().status(&a.peer_id()) != PeerStatus::Online {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        a.kill().await;
        assert!(matches!(a.publish_app("note", "late").await, Err(NodeError::Killed)));
        assert_eq!(a.pending_work(), 0);

        tokio::time::timeout(Duration::from_secs(5), async {
            while b.membership().status(&a.peer_id()) != PeerStatus::Offline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        b.kill().await;
    }
}
