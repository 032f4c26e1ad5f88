//! Gossip replication: push, anti-entropy pull, and admission of received items
//!
//! Each node runs one replicator worker fed by an inbox. Transport callbacks
//! only enqueue work; the worker validates items in batch order (headers
//! first, then entries by author and seq), commits valid entries to the
//! store, buffers incomplete ones, and re-gossips what it accepted.

use crate::entry_store::{EntryStore, EntryStoreError, HoldOutcome};
use crate::membership::MembershipTracker;
use crate::pending::{PendingItem, PendingQueue, PendingStats};
use crate::validation::{PackageSource, ValidationEngine, Verdict};
use chainhold_core::crypto::{header_address, verify_header};
use chainhold_core::types::*;
use chainhold_net::{PeerId, ReplyHandle, Transport, TransportError, WireMessage};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Upper bound on pull pages fetched from one peer in a single sync
const MAX_PULL_PAGES: usize = 8;

/// Sync protocol errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Entry store error: {0}")]
    Store(#[from] EntryStoreError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(&'static str),
}

/// Replicator tuning
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Time between gossip rounds
    pub gossip_interval: Duration,
    /// Peers contacted per round and per push
    pub fanout: usize,
    /// Maximum items per pull response
    pub max_sync_items: u32,
    /// Timeout for pull and package requests
    pub request_timeout: Duration,
    /// Tick-driven retries before an incomplete entry is parked
    pub retry_budget: u32,
    /// Capacity of the pending queue
    pub max_pending: usize,
}

/// Unit of work for the replicator worker
#[derive(Debug)]
pub enum Work {
    /// Items pushed to us or pulled from a peer
    Received {
        items: Vec<GossipItem>,
        from: Option<PeerId>,
    },
    /// Items committed locally that peers should hear about
    Announce(Vec<GossipItem>),
    /// Pull from a specific peer now
    SyncWith(PeerId),
    /// Re-validate pending items
    Retry {
        items: Vec<PendingItem>,
        tick_driven: bool,
    },
}

/// Anti-entropy sync state for a peer
#[derive(Debug, Default)]
pub struct PeerSyncState {
    /// Last successful pull
    pub last_sync: Option<Instant>,
    /// Number of successful pulls
    pub sync_count: u64,
    /// Items received from this peer by pull
    pub items_received: u64,
    /// Consecutive failures
    pub failures: u32,
}

/// Counts outstanding work for as long as it lives
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Gossip replicator for one node
pub struct GossipReplicator {
    local_id: PeerId,
    store: Arc<EntryStore>,
    engine: Arc<ValidationEngine>,
    membership: Arc<MembershipTracker>,
    transport: Arc<dyn Transport>,
    pending: PendingQueue,
    /// Peer sync states
    peers: RwLock<HashMap<PeerId, PeerSyncState>>,
    config: ReplicatorConfig,
    inbox: mpsc::UnboundedSender<Work>,
    /// Queued plus in-flight work items
    backlog: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    rounds: AtomicU64,
}

impl GossipReplicator {
    /// Create a replicator. The receiver must be handed to [`GossipReplicator::run`].
    pub fn new(
        store: Arc<EntryStore>,
        engine: Arc<ValidationEngine>,
        membership: Arc<MembershipTracker>,
        transport: Arc<dyn Transport>,
        config: ReplicatorConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Work>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let replicator = Arc::new(Self {
            local_id: transport.local_id(),
            store,
            engine,
            membership,
            transport,
            pending: PendingQueue::new(config.retry_budget, config.max_pending),
            peers: RwLock::new(HashMap::new()),
            config,
            inbox,
            backlog: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rounds: AtomicU64::new(0),
        });
        (replicator, rx)
    }

    /// Queue work for the worker
    pub fn enqueue(&self, work: Work) {
        self.backlog.fetch_add(1, Ordering::AcqRel);
        if self.inbox.send(work).is_err() {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Worker loop: drain the inbox and run a gossip round every interval
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Work>) {
        let mut ticker = interval(self.config.gossip_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                work = inbox.recv() => {
                    let Some(work) = work else { break };
                    self.process(work).await;
                    self.backlog.fetch_sub(1, Ordering::AcqRel);
                }
                _ = ticker.tick() => {
                    self.gossip_round().await;
                }
            }
        }
        debug!(peer = %self.local_id, "replicator stopped");
    }

    async fn process(&self, work: Work) {
        let result = match work {
            Work::Received { items, from } => self.process_items(items, from).await,
            Work::Announce(items) => {
                self.push(&items, None).await;
                Ok(())
            }
            Work::SyncWith(peer) => self.sync_with(peer).await.map(|_| ()),
            Work::Retry { items, tick_driven } => self.retry(items, tick_driven).await,
        };
        if let Err(e) = result {
            warn!(peer = %self.local_id, "gossip work failed: {}", e);
        }
    }

    /// Validate a batch and re-gossip what was accepted
    async fn process_items(&self, mut items: Vec<GossipItem>, from: Option<PeerId>) -> Result<(), SyncError> {
        items.sort_by_key(|item| item.sort_key());

        let mut fresh = Vec::new();
        for item in items {
            match item {
                GossipItem::Header(header) => {
                    if self.admit_header(&header)? {
                        self.wake(header.author());
                        fresh.push(GossipItem::Header(header));
                    }
                }
                GossipItem::Entry { entry, header } => {
                    let header_addr = match header_address(&header.unsigned) {
                        Ok(addr) => addr,
                        Err(e) => {
                            debug!("dropping unaddressable header: {}", e);
                            continue;
                        }
                    };
                    let item = PendingItem::new(entry, header, header_addr, from, 0);
                    if let Some(accepted) = self.admit(item, None).await? {
                        self.wake(accepted.header().author());
                        fresh.push(accepted);
                    }
                }
            }
        }

        self.push(&fresh, from).await;
        Ok(())
    }

    async fn retry(&self, items: Vec<PendingItem>, tick_driven: bool) -> Result<(), SyncError> {
        for item in items {
            let from = item.from;
            if let Some(accepted) = self.admit(item, Some(tick_driven)).await? {
                self.wake(accepted.header().author());
                self.push(std::slice::from_ref(&accepted), from).await;
            }
        }
        Ok(())
    }

    /// Hold a gossiped header. Returns true if it was new.
    fn admit_header(&self, header: &Header) -> Result<bool, SyncError> {
        if let Err(e) = verify_header(header) {
            debug!(author = %header.author(), seq = header.seq(), "dropping bad header: {}", e);
            return Ok(false);
        }
        match self.store.hold_header(header)? {
            HoldOutcome::Inserted => {
                trace!(author = %header.author(), seq = header.seq(), "header held");
                Ok(true)
            }
            HoldOutcome::AlreadyHeld => Ok(false),
            HoldOutcome::Fork(existing) => {
                warn!(
                    author = %header.author(),
                    seq = header.seq(),
                    held = %existing,
                    "conflicting header for held chain slot"
                );
                Ok(false)
            }
        }
    }

    /// Validate one (entry, header) pair. `retry` is set when the item came
    /// out of the pending queue, with whether a tick drove the retry.
    async fn admit(
        &self,
        item: PendingItem,
        retry: Option<bool>,
    ) -> Result<Option<GossipItem>, SyncError> {
        let addr = item.header_address;
        if self.store.is_valid(&addr)? {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        if let Some(reason) = self.store.rejection(&addr)? {
            trace!(header = %addr, reason = %reason, "already rejected");
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        if retry.is_none() && self.pending.contains(&addr) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        match self.engine.validate(&item.entry, &item.header, self).await? {
            Verdict::Valid { origin, package } => {
                let appended = self.store.append(&item.entry, &item.header)?;
                if appended.inserted {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    info!(
                        address = %appended.address,
                        author = %item.author(),
                        seq = item.header.seq(),
                        origin = ?origin,
                        "entry validated"
                    );
                }
                if origin == PackageOrigin::Author {
                    self.adopt_package(package, item.from)?;
                }
                Ok(Some(GossipItem::Entry {
                    entry: item.entry,
                    header: item.header,
                }))
            }
            Verdict::Invalid(failure) => {
                warn!(
                    header = %addr,
                    author = %item.author(),
                    seq = item.header.seq(),
                    "entry rejected: {}",
                    failure
                );
                self.store.mark_rejected(&addr, &failure.to_string())?;
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Verdict::Incomplete { author, missing_seq } => {
                debug!(
                    header = %addr,
                    author = %author,
                    missing_seq,
                    "entry incomplete, deferring"
                );
                match retry {
                    Some(tick_driven) => self.pending.requeue(item, missing_seq, tick_driven),
                    None => {
                        let mut item = item;
                        item.missing_seq = missing_seq;
                        self.pending.insert(item)
                    }
                };
                Ok(None)
            }
        }
    }

    /// Queue the prior entries an author sent us in its package
    fn adopt_package(&self, package: ValidationPackage, from: Option<PeerId>) -> Result<(), SyncError> {
        let (Some(headers), Some(entries)) = (package.chain_headers, package.chain_entries) else {
            return Ok(());
        };
        let mut items = Vec::new();
        for (header, entry) in headers.into_iter().zip(entries) {
            if !self.store.is_valid(&header_address(&header.unsigned).map_err(EntryStoreError::from)?)? {
                items.push(GossipItem::Entry { entry, header });
            }
        }
        if !items.is_empty() {
            self.enqueue(Work::Received { items, from });
        }
        Ok(())
    }

    /// Retry everything waiting on an author's chain
    fn wake(&self, author: &AgentKey) {
        let items = self.pending.take_author(author);
        if !items.is_empty() {
            trace!(author = %author, count = items.len(), "waking pending entries");
            self.enqueue(Work::Retry {
                items,
                tick_driven: false,
            });
        }
    }

    /// One gossip round: retry active pending items, then pull from a few peers
    async fn gossip_round(&self) {
        let _in_flight = InFlight::new(&self.backlog);
        self.rounds.fetch_add(1, Ordering::Relaxed);

        let retry = self.pending.take_active();
        if !retry.is_empty() {
            if let Err(e) = self.retry(retry, true).await {
                warn!("pending retry failed: {}", e);
            }
        }

        for peer in self.pick_peers(None) {
            if let Err(e) = self.sync_with(peer).await {
                debug!(peer = %peer, "sync failed: {}", e);
            }
        }
    }

    /// Pull everything a peer has that we lack
    pub async fn sync_with(&self, peer: PeerId) -> Result<usize, SyncError> {
        let mut received = 0;
        for _ in 0..MAX_PULL_PAGES {
            let request = self.create_request()?;
            let response = match self
                .transport
                .request(peer, request, self.config.request_timeout)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    self.mark_failure(&peer);
                    return Err(e.into());
                }
            };
            let (items, has_more) = match response {
                WireMessage::PullResponse { items, has_more } => (items, has_more),
                other => {
                    self.mark_failure(&peer);
                    return Err(SyncError::UnexpectedResponse(other.kind()));
                }
            };

            received += items.len();
            self.mark_success(&peer, items.len());
            if items.is_empty() {
                break;
            }
            debug!(peer = %peer, count = items.len(), has_more, "pulled items");
            self.process_items(items, Some(peer)).await?;
            if !has_more {
                break;
            }
        }
        Ok(received)
    }

    /// Pull request carrying our current digest
    pub fn create_request(&self) -> Result<WireMessage, SyncError> {
        Ok(WireMessage::PullRequest {
            summary: self.store.chain_summary()?,
            max_items: self.config.max_sync_items,
        })
    }

    /// Answer a peer's pull request
    pub fn handle_request(&self, summary: &[ChainSummary], max_items: u32) -> Result<WireMessage, SyncError> {
        let limit = max_items.clamp(1, self.config.max_sync_items.max(1)) as usize;
        let (items, has_more) = self.store.compute_delta(summary, limit)?;
        Ok(WireMessage::PullResponse { items, has_more })
    }

    /// Dispatch an inbound message from the transport
    pub fn handle_message(&self, from: PeerId, message: WireMessage, reply: Option<ReplyHandle>) {
        self.mark_seen(&from);
        trace!(peer = %from, kind = message.kind(), "message");

        let response = match message {
            WireMessage::GossipPush { items } => {
                self.enqueue(Work::Received {
                    items,
                    from: Some(from),
                });
                None
            }
            WireMessage::PullRequest { summary, max_items } => {
                match self.handle_request(&summary, max_items) {
                    Ok(response) => Some(response),
                    Err(e) => {
                        warn!(peer = %from, "cannot answer pull: {}", e);
                        None
                    }
                }
            }
            WireMessage::PackageRequest { header } => match self.engine.package_for_request(&header) {
                Ok(package) => Some(WireMessage::PackageResponse { package }),
                Err(e) => {
                    warn!(peer = %from, "cannot build package: {}", e);
                    Some(WireMessage::PackageResponse { package: None })
                }
            },
            WireMessage::Ping => Some(WireMessage::Pong),
            other => {
                debug!(peer = %from, kind = other.kind(), "ignoring unsolicited message");
                None
            }
        };

        if let (Some(reply), Some(response)) = (reply, response) {
            reply.send(response);
        }
    }

    /// Push items to up to `fanout` reachable peers
    async fn push(&self, items: &[GossipItem], exclude: Option<PeerId>) {
        if items.is_empty() {
            return;
        }
        for peer in self.pick_peers(exclude) {
            let message = WireMessage::GossipPush {
                items: items.to_vec(),
            };
            match self.transport.send(peer, message).await {
                Ok(()) => trace!(peer = %peer, count = items.len(), "pushed"),
                Err(e) => {
                    debug!(peer = %peer, "push failed: {}", e);
                    self.mark_failure(&peer);
                }
            }
        }
    }

    fn pick_peers(&self, exclude: Option<PeerId>) -> Vec<PeerId> {
        let candidates: Vec<PeerId> = self
            .membership
            .reachable_peers()
            .into_iter()
            .filter(|peer| Some(*peer) != exclude && *peer != self.local_id)
            .collect();
        candidates
            .choose_multiple(&mut rand::thread_rng(), self.config.fanout)
            .copied()
            .collect()
    }

    /// A peer came online: start tracking it and pull from it right away
    pub fn peer_arrived(&self, peer: PeerId) {
        self.peers.write().entry(peer).or_default();
        self.enqueue(Work::SyncWith(peer));
    }

    /// A peer went offline
    pub fn peer_departed(&self, peer: &PeerId) {
        self.peers.write().remove(peer);
    }

    /// Traffic from a peer proves it reachable, even after failed calls
    fn mark_seen(&self, peer: &PeerId) {
        if self.membership.record_seen(peer) {
            info!(peer = %peer, "peer reachable again");
            self.peer_arrived(*peer);
        }
    }

    fn mark_success(&self, peer: &PeerId, items: usize) {
        self.mark_seen(peer);
        let mut peers = self.peers.write();
        let state = peers.entry(*peer).or_default();
        state.last_sync = Some(Instant::now());
        state.sync_count += 1;
        state.items_received += items as u64;
        state.failures = 0;
    }

    fn mark_failure(&self, peer: &PeerId) {
        if let Some(state) = self.peers.write().get_mut(peer) {
            state.failures += 1;
        }
        if self.membership.record_failure(peer) {
            info!(peer = %peer, "peer marked offline after repeated failures");
        }
    }

    /// Outstanding work: queued and in-flight items plus active pending entries
    pub fn pending_work(&self) -> usize {
        self.backlog.load(Ordering::Acquire) + self.pending.active_count()
    }

    pub fn stats(&self) -> ReplicatorStats {
        let peers = self.peers.read();
        ReplicatorStats {
            peer_count: peers.len(),
            total_syncs: peers.values().map(|s| s.sync_count).sum(),
            rounds: self.rounds.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            backlog: self.backlog.load(Ordering::Acquire),
            pending: self.pending.stats(),
        }
    }
}

#[async_trait::async_trait]
impl PackageSource for GossipReplicator {
    fn author_reachable(&self, author: &AgentKey) -> bool {
        let peer = PeerId::from(*author);
        peer != self.local_id && self.membership.is_reachable(&peer)
    }

    async fn request_package(&self, header: &Header) -> Option<ValidationPackage> {
        let peer = PeerId::from(*header.author());
        let request = WireMessage::PackageRequest {
            header: header.clone(),
        };
        match self
            .transport
            .request(peer, request, self.config.request_timeout)
            .await
        {
            Ok(WireMessage::PackageResponse { package }) => {
                self.mark_seen(&peer);
                package
            }
            Ok(other) => {
                debug!(peer = %peer, kind = other.kind(), "unexpected package response");
                None
            }
            Err(e) => {
                debug!(peer = %peer, "package request failed: {}", e);
                self.mark_failure(&peer);
                None
            }
        }
    }
}

/// Replicator statistics
#[derive(Debug, Clone)]
pub struct ReplicatorStats {
    pub peer_count: usize,
    pub total_syncs: u64,
    pub rounds: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub backlog: usize,
    pub pending: PendingStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry_store::tests::build_chain;
    use crate::membership::PeerStatus;
    use crate::storage::Storage;
    use crate::validation::{FnRule, RuleRegistry};
    use chainhold_net::{KeyPair, MemoryNetwork};

    fn config() -> ReplicatorConfig {
        ReplicatorConfig {
            gossip_interval: Duration::from_secs(3600),
            fanout: 3,
            max_sync_items: 100,
            request_timeout: Duration::from_millis(200),
            retry_budget: 2,
            max_pending: 16,
        }
    }

    fn rules() -> RuleRegistry {
        RuleRegistry::new().with_rule(
            "post",
            FnRule::accept_all(ValidationPackageDefinition::ChainFull),
        )
    }

    fn create_test_replicator(
        net: &MemoryNetwork,
        keypair: &KeyPair,
    ) -> (Arc<GossipReplicator>, mpsc::UnboundedReceiver<Work>, Arc<EntryStore>) {
        let store = Arc::new(EntryStore::new(Arc::new(Storage::open_temporary().unwrap())));
        let engine = Arc::new(ValidationEngine::new(
            store.clone(),
            Arc::new(rules()),
            keypair.agent_key(),
        ));
        let local = PeerId::from(keypair.agent_key());
        let membership = Arc::new(MembershipTracker::new(local, 3));
        membership.join();
        let (transport, _events) = net.attach(local);
        let (replicator, rx) =
            GossipReplicator::new(store.clone(), engine, membership, transport, config());
        (replicator, rx, store)
    }

    fn entries(chain: &[(Entry, Header)]) -> Vec<GossipItem> {
        chain
            .iter()
            .map(|(entry, header)| GossipItem::Entry {
                entry: entry.clone(),
                header: header.clone(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_batch_processed_in_chain_order() {
        let net = MemoryNetwork::new();
        let (replicator, _rx, store) = create_test_replicator(&net, &KeyPair::generate());
        let chain = build_chain(&KeyPair::generate(), 3);

        let mut items = entries(&chain);
        items.reverse();
        replicator.process_items(items, None).await.unwrap();

        assert_eq!(store.entry_count(), 3);
        assert_eq!(replicator.stats().accepted, 3);
        assert_eq!(replicator.pending_work(), 0);
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let net = MemoryNetwork::new();
        let (replicator, _rx, store) = create_test_replicator(&net, &KeyPair::generate());
        let chain = build_chain(&KeyPair::generate(), 2);

        replicator.process_items(entries(&chain), None).await.unwrap();
        replicator.process_items(entries(&chain), None).await.unwrap();

        let stats = replicator.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.duplicates, 2);
        assert_eq!(store.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_rejected_pair_stays_rejected() {
        let net = MemoryNetwork::new();
        let (replicator, _rx, store) = create_test_replicator(&net, &KeyPair::generate());
        let chain = build_chain(&KeyPair::generate(), 1);
        let mut header = chain[0].1.clone();
        header.signature[3] ^= 1;
        let bad = vec![GossipItem::Entry {
            entry: chain[0].0.clone(),
            header,
        }];

        replicator.process_items(bad.clone(), None).await.unwrap();
        replicator.process_items(bad, None).await.unwrap();

        let stats = replicator.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(store.entry_count(), 0);
        assert_eq!(store.rejected_count(), 1);
    }

    #[tokio::test]
    async fn test_incomplete_waits_then_wakes_on_header() {
        let net = MemoryNetwork::new();
        let (replicator, mut rx, store) = create_test_replicator(&net, &KeyPair::generate());
        let chain = build_chain(&KeyPair::generate(), 3);

        // seq 2 without seq 1
        replicator
            .process_items(entries(&[chain[0].clone(), chain[2].clone()]), None)
            .await
            .unwrap();
        assert_eq!(store.entry_count(), 1);
        assert_eq!(replicator.pending.len(), 1);
        assert!(replicator.pending_work() >= 1);

        // Arrival of seq 1 wakes the pending entry
        replicator
            .process_items(entries(&chain[1..2]), None)
            .await
            .unwrap();
        let work = rx.try_recv().unwrap();
        replicator.process(work).await;
        replicator.backlog.fetch_sub(1, Ordering::AcqRel);

        assert_eq!(store.entry_count(), 3);
        assert!(replicator.pending.is_empty());
    }

    #[tokio::test]
    async fn test_gap_is_parked_not_promoted() {
        let net = MemoryNetwork::new();
        let (replicator, _rx, store) = create_test_replicator(&net, &KeyPair::generate());
        let chain = build_chain(&KeyPair::generate(), 3);

        replicator
            .process_items(entries(&[chain[0].clone(), chain[2].clone()]), None)
            .await
            .unwrap();

        for _ in 0..3 {
            replicator.gossip_round().await;
        }

        assert_eq!(replicator.pending.stats().parked, 1);
        assert_eq!(replicator.pending_work(), 0);
        assert!(!store.has_entry(chain[2].1.entry_address()).unwrap());
    }

    #[tokio::test]
    async fn test_traffic_from_failed_peer_brings_it_back() {
        let net = MemoryNetwork::new();
        let (replicator, mut rx, _store) = create_test_replicator(&net, &KeyPair::generate());
        let peer = PeerId::from(KeyPair::generate().agent_key());

        replicator.membership.peer_online(peer, None).unwrap();
        for _ in 0..3 {
            replicator.mark_failure(&peer);
        }
        assert_eq!(replicator.membership.status(&peer), PeerStatus::Offline);

        replicator.handle_message(peer, WireMessage::GossipPush { items: vec![] }, None);
        assert_eq!(replicator.membership.status(&peer), PeerStatus::Online);

        // A fresh pull is scheduled for the revived peer
        let mut synced = false;
        while let Ok(work) = rx.try_recv() {
            synced |= matches!(work, Work::SyncWith(p) if p == peer);
        }
        assert!(synced);
    }

    #[tokio::test]
    async fn test_handle_request_returns_delta() {
        let net = MemoryNetwork::new();
        let (replicator, _rx, _store) = create_test_replicator(&net, &KeyPair::generate());
        let chain = build_chain(&KeyPair::generate(), 2);
        replicator.process_items(entries(&chain), None).await.unwrap();

        match replicator.handle_request(&[], 1).unwrap() {
            WireMessage::PullResponse { items, has_more } => {
                assert_eq!(items.len(), 1);
                assert!(has_more);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
