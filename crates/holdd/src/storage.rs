//! Persistent storage using sled

use chainhold_core::types::*;
use sled::Db;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Corrupt record in {tree}: {detail}")]
    Corrupt { tree: &'static str, detail: String },
}

/// Storage backend for a node
pub struct Storage {
    db: Db,
    /// Entry tree: entry address -> Entry
    entries: sled::Tree,
    /// Header tree: header address -> Header
    headers: sled::Tree,
    /// Chain index: author || seq (big-endian) -> header address
    chains: sled::Tree,
    /// Validated pairs: header address -> entry address
    valid: sled::Tree,
    /// Lookup: entry address -> first validated header address
    entry_index: sled::Tree,
    /// Rejected pairs: header address -> reason
    rejected: sled::Tree,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
}

fn chain_key(author: &AgentKey, seq: u64) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(&author.0);
    key[32..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn bytes32(tree: &'static str, bytes: &[u8]) -> Result<Bytes32, StorageError> {
    bytes.try_into().map_err(|_| StorageError::Corrupt {
        tree,
        detail: format!("expected 32 bytes, got {}", bytes.len()),
    })
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Open a throwaway database that is deleted on drop
    pub fn open_temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let entries = db.open_tree("entries")?;
        let headers = db.open_tree("headers")?;
        let chains = db.open_tree("chains")?;
        let valid = db.open_tree("valid")?;
        let entry_index = db.open_tree("entry_index")?;
        let rejected = db.open_tree("rejected")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            entries,
            headers,
            chains,
            valid,
            entry_index,
            rejected,
            metadata,
        })
    }

    /// Store an entry unless one is already stored at this address.
    /// Returns true if this call wrote it.
    pub fn put_entry_if_absent(
        &self,
        address: &Address,
        entry: &Entry,
    ) -> Result<bool, StorageError> {
        let value = postcard::to_allocvec(entry)?;
        let swapped = self
            .entries
            .compare_and_swap(address.0, None as Option<&[u8]>, Some(value))?;
        Ok(swapped.is_ok())
    }

    /// Get an entry by address
    pub fn get_entry(&self, address: &Address) -> Result<Option<Entry>, StorageError> {
        match self.entries.get(address.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store a header (content-addressed, so overwriting is harmless)
    pub fn put_header(&self, address: &HeaderAddress, header: &Header) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(header)?;
        self.headers.insert(address.0, value)?;
        Ok(())
    }

    /// Get a header by address
    pub fn get_header(&self, address: &HeaderAddress) -> Result<Option<Header>, StorageError> {
        match self.headers.get(address.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Claim `(author, seq)` in the chain index.
    ///
    /// Returns `Ok(())` if the slot was empty or already held this header,
    /// `Err(existing)` if a different header occupies it.
    pub fn claim_chain_slot(
        &self,
        author: &AgentKey,
        seq: u64,
        address: &HeaderAddress,
    ) -> Result<Result<(), HeaderAddress>, StorageError> {
        let key = chain_key(author, seq);
        match self
            .chains
            .compare_and_swap(key, None as Option<&[u8]>, Some(&address.0[..]))?
        {
            Ok(()) => Ok(Ok(())),
            Err(cas) => {
                let existing = match cas.current {
                    Some(bytes) => HeaderAddress(bytes32("chains", &bytes)?),
                    None => return Ok(Ok(())),
                };
                if &existing == address {
                    Ok(Ok(()))
                } else {
                    Ok(Err(existing))
                }
            }
        }
    }

    /// Header address at `(author, seq)`, if held
    pub fn chain_slot(
        &self,
        author: &AgentKey,
        seq: u64,
    ) -> Result<Option<HeaderAddress>, StorageError> {
        match self.chains.get(chain_key(author, seq))? {
            Some(bytes) => Ok(Some(HeaderAddress(bytes32("chains", &bytes)?))),
            None => Ok(None),
        }
    }

    /// All held `(seq, header address)` pairs for an author, in seq order
    pub fn chain_slots(&self, author: &AgentKey) -> Result<Vec<(u64, HeaderAddress)>, StorageError> {
        let mut slots = Vec::new();
        for result in self.chains.scan_prefix(author.0) {
            let (key, value) = result?;
            let mut seq_bytes = [0u8; 8];
            seq_bytes.copy_from_slice(&key[32..40]);
            slots.push((
                u64::from_be_bytes(seq_bytes),
                HeaderAddress(bytes32("chains", &value)?),
            ));
        }
        Ok(slots)
    }

    /// Every author with at least one held header
    pub fn chain_authors(&self) -> Result<Vec<AgentKey>, StorageError> {
        let mut authors: Vec<AgentKey> = Vec::new();
        for result in self.chains.iter().keys() {
            let key = result?;
            let author = AgentKey(bytes32("chains", &key[..32])?);
            if authors.last() != Some(&author) {
                authors.push(author);
            }
        }
        Ok(authors)
    }

    /// Record a validated (header, entry) pair.
    /// Returns true if this call recorded it.
    pub fn mark_valid(
        &self,
        header: &HeaderAddress,
        entry: &Address,
    ) -> Result<bool, StorageError> {
        let recorded = self
            .valid
            .compare_and_swap(header.0, None as Option<&[u8]>, Some(&entry.0[..]))?
            .is_ok();
        // First validated header wins the lookup slot
        let _ = self
            .entry_index
            .compare_and_swap(entry.0, None as Option<&[u8]>, Some(&header.0[..]))?;
        Ok(recorded)
    }

    /// Whether a header has been validated together with its entry
    pub fn is_valid(&self, header: &HeaderAddress) -> Result<bool, StorageError> {
        Ok(self.valid.contains_key(header.0)?)
    }

    /// Validated header for an entry address
    pub fn valid_header_for(&self, entry: &Address) -> Result<Option<HeaderAddress>, StorageError> {
        match self.entry_index.get(entry.0)? {
            Some(bytes) => Ok(Some(HeaderAddress(bytes32("entry_index", &bytes)?))),
            None => Ok(None),
        }
    }

    /// Addresses of every validated entry
    pub fn valid_entry_addresses(&self) -> Result<Vec<Address>, StorageError> {
        let mut addresses = Vec::new();
        for result in self.entry_index.iter().keys() {
            addresses.push(Address(bytes32("entry_index", &result?)?));
        }
        Ok(addresses)
    }

    /// Record a permanently rejected header
    pub fn put_rejected(&self, header: &HeaderAddress, reason: &str) -> Result<(), StorageError> {
        self.rejected.insert(header.0, reason.as_bytes())?;
        Ok(())
    }

    /// Rejection reason, if the header was rejected
    pub fn get_rejected(&self, header: &HeaderAddress) -> Result<Option<String>, StorageError> {
        Ok(self
            .rejected
            .get(header.0)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Count validated entries
    pub fn entry_count(&self) -> usize {
        self.entry_index.len()
    }

    /// Count held headers
    pub fn header_count(&self) -> usize {
        self.chains.len()
    }

    /// Count rejected headers
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    /// Store metadata
    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    /// Get metadata
    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
