//! holdd server - main service loop

use crate::config::{Config, NodeState};
use crate::membership::MembershipEvent;
use crate::node::{Node, NodeError};
use crate::storage::{Storage, StorageError};
use crate::validation::RuleRegistry;
use chainhold_net::{KeyPair, PeerId, TcpTransport, TransportError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(30);
/// How often unreachable bootstrap peers are dialed again
const REDIAL_INTERVAL: Duration = Duration::from_secs(15);

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Node error: {0}")]
    Node(#[from] NodeError),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Data directory belongs to agent {stored}, not {given}")]
    IdentityMismatch { stored: PeerId, given: PeerId },
}

/// Bootstrap addresses and the peer each one last led to
#[derive(Debug, Default)]
struct BootstrapPeers {
    addrs: HashMap<SocketAddr, Option<PeerId>>,
}

impl BootstrapPeers {
    fn new(addrs: &[SocketAddr]) -> Self {
        Self {
            addrs: addrs.iter().map(|addr| (*addr, None)).collect(),
        }
    }

    /// Addresses with no live connection behind them
    fn due(&self, connected: &[PeerId]) -> Vec<SocketAddr> {
        let mut due: Vec<_> = self
            .addrs
            .iter()
            .filter(|(_, peer)| !peer.is_some_and(|peer| connected.contains(&peer)))
            .map(|(addr, _)| *addr)
            .collect();
        due.sort();
        due
    }

    fn record(&mut self, addr: SocketAddr, peer: PeerId) {
        self.addrs.insert(addr, Some(peer));
    }

    /// Dial every due address once
    async fn dial(&mut self, transport: &Arc<TcpTransport>) {
        for addr in self.due(&transport.connected_peers()) {
            match transport.connect(addr).await {
                Ok(peer) => {
                    info!(peer = %peer, addr = %addr, "connected to bootstrap peer");
                    self.record(addr, peer);
                }
                Err(e) => warn!(addr = %addr, "bootstrap connect failed: {}", e),
            }
        }
    }
}

/// Server state
pub struct Server {
    config: Config,
    keypair: KeyPair,
    storage: Arc<Storage>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Open storage and load (or create) the agent identity
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let keypair = Self::load_keypair(&config, &storage)?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            keypair,
            storage,
            shutdown_tx,
        })
    }

    fn load_keypair(config: &Config, storage: &Storage) -> Result<KeyPair, ServerError> {
        let given = config.seed().map_err(|e| ServerError::Config(e.to_string()))?;
        let stored = NodeState::load(storage)?;

        let seed = match (given, stored) {
            (Some(given), Some(state)) if given != state.keypair_seed => {
                return Err(ServerError::IdentityMismatch {
                    stored: PeerId::from(KeyPair::from_seed(&state.keypair_seed).agent_key()),
                    given: PeerId::from(KeyPair::from_seed(&given).agent_key()),
                });
            }
            (_, Some(state)) => state.keypair_seed,
            (Some(given), None) => given,
            (None, None) => KeyPair::generate().seed(),
        };

        NodeState { keypair_seed: seed }.save(storage)?;
        storage.flush()?;
        Ok(KeyPair::from_seed(&seed))
    }

    /// Our peer id
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.keypair.agent_key())
    }

    /// Run until shutdown or ctrl-c
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let (transport, events) = TcpTransport::bind(self.peer_id(), self.config.listen).await?;
        let node = Node::spawn(
            self.config.node_config(),
            self.storage.clone(),
            self.keypair.clone(),
            RuleRegistry::new(),
            transport.clone(),
            events,
        )
        .await?;
        info!(
            peer = %node.peer_id(),
            listen = ?transport.listen_addr(),
            "holdd running"
        );

        for content in &self.config.publish {
            let address = node
                .publish_app(self.config.entry_type.clone(), content.as_bytes())
                .await?;
            info!(address = %address, "published startup entry");
        }

        let mut bootstrap = BootstrapPeers::new(&self.config.bootstrap);
        bootstrap.dial(&transport).await;

        let mut membership_rx = node.membership().subscribe();
        let mut stats_ticker = interval(STATS_INTERVAL);
        let mut redial_ticker = interval(REDIAL_INTERVAL);
        redial_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        redial_ticker.reset();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
                _ = stats_ticker.tick() => {
                    let stats = node.stats();
                    info!(
                        entries = stats.entry_count,
                        headers = stats.header_count,
                        rejected = stats.rejected_count,
                        online = stats.membership.online,
                        backlog = stats.replicator.backlog,
                        pending = stats.replicator.pending.active,
                        parked = stats.replicator.pending.parked,
                        "node stats"
                    );
                }
                _ = redial_ticker.tick() => bootstrap.dial(&transport).await,
                event = membership_rx.recv() => match event {
                    Ok(MembershipEvent::PeerOnline(peer)) => debug!(peer = %peer, "membership: online"),
                    Ok(MembershipEvent::PeerOffline(peer)) => debug!(peer = %peer, "membership: offline"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "membership events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }

        node.kill().await;
        self.storage.flush()?;
        Ok(())
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
