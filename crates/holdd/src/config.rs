//! Configuration for holdd

use crate::storage::{Storage, StorageError};
use crate::sync::ReplicatorConfig;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// holdd - chainhold node daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "holdd")]
#[command(about = "chainhold node: validated source chains with gossip replication")]
pub struct Config {
    /// Listen address for peer connections
    #[arg(short, long, default_value = "0.0.0.0:9300")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/holdd")]
    pub data_dir: PathBuf,

    /// Bootstrap peers (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<SocketAddr>,

    /// Gossip round interval in milliseconds
    #[arg(long, default_value = "1000")]
    pub gossip_interval_ms: u64,

    /// Peers contacted per gossip round
    #[arg(long, default_value = "3")]
    pub fanout: usize,

    /// Maximum items per pull response
    #[arg(long, default_value = "500")]
    pub max_sync_items: u32,

    /// Gossip ticks an incomplete entry is retried before it is parked
    #[arg(long, default_value = "10")]
    pub retry_budget: u32,

    /// Capacity of the incomplete-entry queue
    #[arg(long, default_value = "10000")]
    pub max_pending: usize,

    /// Timeout for pull and package requests in milliseconds
    #[arg(long, default_value = "5000")]
    pub request_timeout_ms: u64,

    /// Consecutive failed calls before a peer is considered offline
    #[arg(long, default_value = "3")]
    pub max_failures: u32,

    /// Agent keypair seed (64 hex chars); overrides the persisted identity
    #[arg(long, env = "HOLDD_KEYPAIR_SEED")]
    pub keypair_seed: Option<String>,

    /// Publish an entry with this content at startup (repeatable)
    #[arg(long)]
    pub publish: Vec<String>,

    /// Entry type used for --publish
    #[arg(long, default_value = "note")]
    pub entry_type: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gossip_interval_ms == 0 {
            anyhow::bail!("Gossip interval must be positive");
        }
        if self.fanout == 0 {
            anyhow::bail!("Fanout must be at least 1");
        }
        if self.max_sync_items == 0 {
            anyhow::bail!("max-sync-items must be at least 1");
        }
        if self.max_pending == 0 {
            anyhow::bail!("max-pending must be at least 1");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        chainhold_core::canonical::validate_entry_type(&chainhold_core::EntryType::App(
            self.entry_type.clone(),
        ))?;
        self.seed()?;
        Ok(())
    }

    /// Keypair seed given on the command line or in the environment
    pub fn seed(&self) -> anyhow::Result<Option<[u8; 32]>> {
        let Some(hex_seed) = &self.keypair_seed else {
            return Ok(None);
        };
        let bytes = hex::decode(hex_seed.trim())?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Keypair seed must be 32 bytes"))?;
        Ok(Some(seed))
    }

    /// Runtime settings for the node
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            fanout: self.fanout,
            max_sync_items: self.max_sync_items,
            retry_budget: self.retry_budget,
            max_pending: self.max_pending,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_failures: self.max_failures,
        }
    }
}

/// Runtime settings of one node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub gossip_interval: Duration,
    pub fanout: usize,
    pub max_sync_items: u32,
    pub retry_budget: u32,
    pub max_pending: usize,
    pub request_timeout: Duration,
    pub max_failures: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(1),
            fanout: 3,
            max_sync_items: 500,
            retry_budget: 10,
            max_pending: 10_000,
            request_timeout: Duration::from_secs(5),
            max_failures: 3,
        }
    }
}

impl NodeConfig {
    /// Fast settings for in-process tests
    pub fn test_config() -> Self {
        Self {
            gossip_interval: Duration::from_millis(50),
            retry_budget: 5,
            request_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    pub fn replicator_config(&self) -> ReplicatorConfig {
        ReplicatorConfig {
            gossip_interval: self.gossip_interval,
            fanout: self.fanout,
            max_sync_items: self.max_sync_items,
            request_timeout: self.request_timeout,
            retry_budget: self.retry_budget,
            max_pending: self.max_pending,
        }
    }
}

const NODE_STATE_KEY: &str = "node_state";

/// Persisted node state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Agent keypair seed; the chain on disk belongs to this key
    pub keypair_seed: [u8; 32],
}

impl NodeState {
    pub fn load(storage: &Storage) -> Result<Option<Self>, StorageError> {
        match storage.get_metadata(NODE_STATE_KEY)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, storage: &Storage) -> Result<(), StorageError> {
        storage.put_metadata(NODE_STATE_KEY, &postcard::to_allocvec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("holdd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_validate() {
        let config = parse(&[]);
        assert!(config.validate().is_ok());
        assert_eq!(config.node_config().fanout, 3);
        assert_eq!(config.seed().unwrap(), None);
    }

    #[test]
    fn test_seed_parsing() {
        let config = parse(&["--keypair-seed", &"ab".repeat(32)]);
        assert_eq!(config.seed().unwrap(), Some([0xab; 32]));

        let short = parse(&["--keypair-seed", "abcd"]);
        assert!(short.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(parse(&["--fanout", "0"]).validate().is_err());
        assert!(parse(&["--log-format", "xml"]).validate().is_err());
        assert!(parse(&["--entry-type", "two words"]).validate().is_err());
    }

    #[test]
    fn test_bootstrap_list() {
        let config = parse(&["--bootstrap", "127.0.0.1:9301,127.0.0.1:9302"]);
        assert_eq!(config.bootstrap.len(), 2);
    }

    #[test]
    fn test_node_state_roundtrip_through_storage() {
        let storage = Storage::open_temporary().unwrap();
        assert!(NodeState::load(&storage).unwrap().is_none());

        NodeState { keypair_seed: [7; 32] }.save(&storage).unwrap();
        assert_eq!(NodeState::load(&storage).unwrap().unwrap().keypair_seed, [7; 32]);
    }
}
