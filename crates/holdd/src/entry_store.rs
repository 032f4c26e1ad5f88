//! Content-addressed entry store with per-author chain index

use crate::storage::{Storage, StorageError};
use chainhold_core::crypto::{header_address, verify_entry_address};
use chainhold_core::types::*;
use std::sync::Arc;
use thiserror::Error;

/// Entry store errors
#[derive(Debug, Error)]
pub enum EntryStoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Core error: {0}")]
    Core(#[from] chainhold_core::Error),
    #[error("Fork at {author} seq {seq}: slot already holds {existing}")]
    Fork {
        author: AgentKey,
        seq: u64,
        existing: HeaderAddress,
    },
    #[error("Header {0} referenced by the chain index is missing")]
    MissingHeader(HeaderAddress),
}

/// Result of holding a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
    /// Newly added to the chain index
    Inserted,
    /// Already held
    AlreadyHeld,
    /// A different header occupies `(author, seq)`
    Fork(HeaderAddress),
}

/// Result of an append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub address: Address,
    /// False if the pair was already held
    pub inserted: bool,
}

/// Chain prefix lookup result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainPrefix {
    /// Headers `0..upto` in chain order
    Complete(Vec<Header>),
    /// First seq in `0..upto` that is not held
    Gap { missing_seq: u64 },
}

/// Local store of validated entries and held headers.
///
/// An entry becomes visible through [`EntryStore::get`] only once it has
/// been appended, which callers do only after validation. Headers may be
/// held without their entry; they extend the chain index used to rebuild
/// validation packages.
pub struct EntryStore {
    storage: Arc<Storage>,
}

impl EntryStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Append a validated (entry, header) pair. Idempotent.
    pub fn append(&self, entry: &Entry, header: &Header) -> Result<Appended, EntryStoreError> {
        verify_entry_address(entry, header)?;
        let address = *header.entry_address();

        if let HoldOutcome::Fork(existing) = self.hold_header(header)? {
            return Err(EntryStoreError::Fork {
                author: *header.author(),
                seq: header.seq(),
                existing,
            });
        }

        let header_addr = header_address(&header.unsigned)?;
        self.storage.put_entry_if_absent(&address, entry)?;
        let inserted = self.storage.mark_valid(&header_addr, &address)?;

        Ok(Appended { address, inserted })
    }

    /// Record a verified header in the chain index.
    /// Does not make any entry visible.
    pub fn hold_header(&self, header: &Header) -> Result<HoldOutcome, EntryStoreError> {
        let addr = header_address(&header.unsigned)?;
        match self
            .storage
            .claim_chain_slot(header.author(), header.seq(), &addr)?
        {
            Err(existing) => Ok(HoldOutcome::Fork(existing)),
            Ok(()) => {
                if self.storage.get_header(&addr)?.is_some() {
                    return Ok(HoldOutcome::AlreadyHeld);
                }
                self.storage.put_header(&addr, header)?;
                Ok(HoldOutcome::Inserted)
            }
        }
    }

    /// Get a validated entry and the header it was validated with
    pub fn get(&self, address: &Address) -> Result<Option<(Entry, Header)>, EntryStoreError> {
        let Some(header_addr) = self.storage.valid_header_for(address)? else {
            return Ok(None);
        };
        let header = self
            .storage
            .get_header(&header_addr)?
            .ok_or(EntryStoreError::MissingHeader(header_addr))?;
        Ok(self.storage.get_entry(address)?.map(|entry| (entry, header)))
    }

    /// Whether an entry is held as valid
    pub fn has_entry(&self, address: &Address) -> Result<bool, EntryStoreError> {
        Ok(self.storage.valid_header_for(address)?.is_some())
    }

    /// Whether this exact (entry, header) pair has been validated
    pub fn is_valid(&self, header: &HeaderAddress) -> Result<bool, EntryStoreError> {
        Ok(self.storage.is_valid(header)?)
    }

    /// Header held at `(author, seq)`
    pub fn header_at(&self, author: &AgentKey, seq: u64) -> Result<Option<Header>, EntryStoreError> {
        match self.storage.chain_slot(author, seq)? {
            Some(addr) => Ok(Some(self.load_header(&addr)?)),
            None => Ok(None),
        }
    }

    /// Held headers of an author in chain order (may contain gaps)
    pub fn headers_by_author(&self, author: &AgentKey) -> Result<Vec<Header>, EntryStoreError> {
        self.storage
            .chain_slots(author)?
            .iter()
            .map(|(_, addr)| self.load_header(addr))
            .collect()
    }

    /// Highest-seq held header of an author
    pub fn latest_header(&self, author: &AgentKey) -> Result<Option<Header>, EntryStoreError> {
        match self.storage.chain_slots(author)?.last() {
            Some((_, addr)) => Ok(Some(self.load_header(addr)?)),
            None => Ok(None),
        }
    }

    /// Headers `0..upto_seq` of an author, or the first missing seq
    pub fn chain_prefix(&self, author: &AgentKey, upto_seq: u64) -> Result<ChainPrefix, EntryStoreError> {
        // upto_seq comes off the wire; size the vector by what is held
        let mut headers = Vec::new();
        for seq in 0..upto_seq {
            match self.storage.chain_slot(author, seq)? {
                Some(addr) => headers.push(self.load_header(&addr)?),
                None => return Ok(ChainPrefix::Gap { missing_seq: seq }),
            }
        }
        Ok(ChainPrefix::Complete(headers))
    }

    /// First seq below `upto_seq` with no held header, if any
    pub fn first_gap(&self, author: &AgentKey, upto_seq: u64) -> Result<Option<u64>, EntryStoreError> {
        let mut expected = 0;
        for (seq, _) in self.storage.chain_slots(author)? {
            if seq >= upto_seq {
                break;
            }
            if seq != expected {
                return Ok(Some(expected));
            }
            expected += 1;
        }
        Ok((expected < upto_seq).then_some(expected))
    }

    /// Entries for a run of headers, or the seq of the first header whose
    /// entry is not held as valid
    pub fn chain_entries(&self, headers: &[Header]) -> Result<Result<Vec<Entry>, u64>, EntryStoreError> {
        let mut entries = Vec::with_capacity(headers.len());
        for header in headers {
            let addr = header_address(&header.unsigned)?;
            if !self.storage.is_valid(&addr)? {
                return Ok(Err(header.seq()));
            }
            match self.storage.get_entry(header.entry_address())? {
                Some(entry) => entries.push(entry),
                None => return Ok(Err(header.seq())),
            }
        }
        Ok(Ok(entries))
    }

    /// Anti-entropy digest of everything held
    pub fn chain_summary(&self) -> Result<Vec<ChainSummary>, EntryStoreError> {
        let mut summaries = Vec::new();
        for author in self.storage.chain_authors()? {
            let mut summary = ChainSummary {
                author,
                contiguous_len: 0,
                detached_seqs: Vec::new(),
                held_entry_seqs: Vec::new(),
            };
            for (seq, addr) in self.storage.chain_slots(&author)? {
                if seq == summary.contiguous_len && summary.detached_seqs.is_empty() {
                    summary.contiguous_len += 1;
                } else {
                    summary.detached_seqs.push(seq);
                }
                if self.storage.is_valid(&addr)? {
                    summary.held_entry_seqs.push(seq);
                }
            }
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Items we hold that a peer's digest says it lacks.
    /// Returns the items and whether more were left out.
    pub fn compute_delta(
        &self,
        peer: &[ChainSummary],
        max_items: usize,
    ) -> Result<(Vec<GossipItem>, bool), EntryStoreError> {
        let mut delta = Vec::new();

        for author in self.storage.chain_authors()? {
            let theirs = peer.iter().find(|s| s.author == author);
            for (seq, addr) in self.storage.chain_slots(&author)? {
                let has_entry = theirs.map_or(false, |s| s.has_entry(seq));
                let has_header = theirs.map_or(false, |s| s.has_header(seq));
                if has_entry {
                    continue;
                }
                let valid = self.storage.is_valid(&addr)?;
                if !valid && has_header {
                    continue;
                }

                if delta.len() == max_items {
                    return Ok((delta, true));
                }

                let header = self.load_header(&addr)?;
                if valid {
                    if let Some(entry) = self.storage.get_entry(header.entry_address())? {
                        delta.push(GossipItem::Entry { entry, header });
                        continue;
                    }
                }
                if !has_header {
                    delta.push(GossipItem::Header(header));
                }
            }
        }

        Ok((delta, false))
    }

    /// Remember that a pair failed validation
    pub fn mark_rejected(&self, header: &HeaderAddress, reason: &str) -> Result<(), EntryStoreError> {
        Ok(self.storage.put_rejected(header, reason)?)
    }

    /// Rejection reason, if this pair failed validation before
    pub fn rejection(&self, header: &HeaderAddress) -> Result<Option<String>, EntryStoreError> {
        Ok(self.storage.get_rejected(header)?)
    }

    /// Addresses of every entry held as valid
    pub fn held_addresses(&self) -> Result<Vec<Address>, EntryStoreError> {
        Ok(self.storage.valid_entry_addresses()?)
    }

    pub fn entry_count(&self) -> usize {
        self.storage.entry_count()
    }

    pub fn header_count(&self) -> usize {
        self.storage.header_count()
    }

    pub fn rejected_count(&self) -> usize {
        self.storage.rejected_count()
    }

    pub fn flush(&self) -> Result<(), EntryStoreError> {
        Ok(self.storage.flush()?)
    }

    fn load_header(&self, addr: &HeaderAddress) -> Result<Header, EntryStoreError> {
        self.storage
            .get_header(addr)?
            .ok_or(EntryStoreError::MissingHeader(*addr))
    }
}
