//! Core data types for chainhold source chains
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte fixed-size array used for hashes and identifiers.
pub type Bytes32 = [u8; 32];

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Content address of an entry: BLAKE3("entry" || canonical_bytes(Entry))
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub Bytes32);

/// Address of a header: BLAKE3("header" || canonical_bytes(HeaderUnsigned))
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeaderAddress(pub Bytes32);

/// Author identity: ed25519 verifying key bytes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentKey(pub Bytes32);

impl Address {
    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(Self(bytes.try_into().ok()?))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for HeaderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

// =============================================================================
// ENTRIES AND HEADERS
// =============================================================================

/// Kind of an entry; selects the validation rule applied to it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryType {
    /// Genesis entry at sequence 0; content is the author's key
    AgentId,
    /// Application entry, named by its type
    App(String),
}

impl EntryType {
    /// Application type name, if any.
    pub fn app_name(&self) -> Option<&str> {
        match self {
            EntryType::AgentId => None,
            EntryType::App(name) => Some(name),
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::AgentId => write!(f, "%agent_id"),
            EntryType::App(name) => write!(f, "{}", name),
        }
    }
}

/// Immutable content blob
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    pub entry_type: EntryType,
    pub content: Vec<u8>,
}

impl Entry {
    pub fn new(entry_type: EntryType, content: impl Into<Vec<u8>>) -> Self {
        Self {
            entry_type,
            content: content.into(),
        }
    }

    /// Genesis entry for an author.
    pub fn agent_id(author: &AgentKey) -> Self {
        Self::new(EntryType::AgentId, author.0.to_vec())
    }
}

/// Header content covered by the author's signature (hashed to HeaderAddress)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderUnsigned {
    pub entry_type: EntryType,
    pub entry_address: Address,
    pub author: AgentKey,
    /// Position in the author's chain, 0 for genesis
    pub seq: u64,
    /// Previous header in the author's chain, None only at seq 0
    pub prev_header: Option<HeaderAddress>,
    pub timestamp_ms: u64,
}

/// Signed chain-linked metadata record for an entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub unsigned: HeaderUnsigned,
    /// ed25519 signature over "header-sig" || canonical_bytes(unsigned)
    pub signature: Vec<u8>,
}

impl Header {
    pub fn author(&self) -> &AgentKey {
        &self.unsigned.author
    }

    pub fn seq(&self) -> u64 {
        self.unsigned.seq
    }

    pub fn entry_address(&self) -> &Address {
        &self.unsigned.entry_address
    }

    pub fn entry_type(&self) -> &EntryType {
        &self.unsigned.entry_type
    }

    pub fn prev_header(&self) -> Option<&HeaderAddress> {
        self.unsigned.prev_header.as_ref()
    }
}

// =============================================================================
// VALIDATION PACKAGES
// =============================================================================

/// What an entry type needs in order to be validated
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ValidationPackageDefinition {
    /// The header alone
    #[default]
    Entry,
    /// Every prior header of the author's chain
    ChainHeaders,
    /// Every prior header plus the entries they reference
    ChainEntries,
    /// Same content as ChainEntries, with headers always included
    ChainFull,
}

impl ValidationPackageDefinition {
    /// Whether the author's prior chain is needed.
    pub fn requires_chain(&self) -> bool {
        !matches!(self, ValidationPackageDefinition::Entry)
    }

    pub fn requires_entries(&self) -> bool {
        matches!(
            self,
            ValidationPackageDefinition::ChainEntries | ValidationPackageDefinition::ChainFull
        )
    }
}

/// Where a validation package came from
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PackageOrigin {
    /// Only the header was required
    HeaderOnly,
    /// Built by the author for its own publish
    SelfAuthored,
    /// Sent directly by the (reachable) author
    Author,
    /// Rebuilt from headers already held locally
    Reconstructed,
}

/// Provenance needed to validate an entry. Built on demand, never persisted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationPackage {
    pub header: Header,
    /// Headers 0..header.seq in chain order
    pub chain_headers: Option<Vec<Header>>,
    /// Entries referenced by chain_headers, same order
    pub chain_entries: Option<Vec<Entry>>,
    pub origin: PackageOrigin,
}

impl ValidationPackage {
    pub fn only_header(header: Header) -> Self {
        Self {
            header,
            chain_headers: None,
            chain_entries: None,
            origin: PackageOrigin::HeaderOnly,
        }
    }
}

// =============================================================================
// GOSSIP
// =============================================================================

/// Anti-entropy digest for one author's chain
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainSummary {
    pub author: AgentKey,
    /// Number of headers held contiguously from seq 0
    pub contiguous_len: u64,
    /// Held header seqs beyond the first gap, ascending
    pub detached_seqs: Vec<u64>,
    /// Seqs whose entry is held as valid, ascending
    pub held_entry_seqs: Vec<u64>,
}

impl ChainSummary {
    /// Whether the header at `seq` is held.
    pub fn has_header(&self, seq: u64) -> bool {
        seq < self.contiguous_len || self.detached_seqs.binary_search(&seq).is_ok()
    }

    /// Whether the entry at `seq` is held as valid.
    pub fn has_entry(&self, seq: u64) -> bool {
        self.held_entry_seqs.binary_search(&seq).is_ok()
    }
}

/// Unit of replicated data
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum GossipItem {
    /// Header alone, extends the receiver's chain index
    Header(Header),
    /// Entry with the header that attests it
    Entry { entry: Entry, header: Header },
}

impl GossipItem {
    pub fn header(&self) -> &Header {
        match self {
            GossipItem::Header(header) => header,
            GossipItem::Entry { header, .. } => header,
        }
    }

    /// Processing order within a batch: headers first, then entries by (author, seq).
    pub fn sort_key(&self) -> (u8, AgentKey, u64) {
        let kind = match self {
            GossipItem::Header(_) => 0,
            GossipItem::Entry { .. } => 1,
        };
        (kind, *self.header().author(), self.header().seq())
    }
}
