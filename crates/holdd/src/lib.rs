//! holdd - chainhold node
//!
//! This crate provides:
//! - Persistent storage of entries, headers and per-author chain indexes
//! - Validation of entries with packages fetched from the author or
//!   reconstructed from locally held chain data
//! - A bounded queue for entries whose author chain is still incomplete
//! - Peer membership tracking
//! - Gossip replication (push on accept, periodic pull)
//! - The [`Node`] façade tying these together, and the daemon server

pub mod config;
pub mod entry_store;
pub mod membership;
pub mod node;
pub mod pending;
pub mod server;
pub mod storage;
pub mod sync;
pub mod validation;

pub use config::{Config, NodeConfig};
pub use entry_store::EntryStore;
pub use membership::{MembershipTracker, PeerStatus};
pub use node::{Node, NodeError, NodeStats};
pub use server::Server;
pub use storage::Storage;
pub use sync::GossipReplicator;
pub use validation::{EntryValidator, FnRule, RuleRegistry, ValidationFailure};
