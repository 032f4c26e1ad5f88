//! Canonical encoding for chainhold
//!
//! All hashed/signed objects use postcard serialization with strict constraints:
//! - No maps/hashmaps
//! - Field order is Rust struct field order
//! - Entry type names are non-empty printable ASCII without whitespace
//! - Chain header lists are sorted by seq with no duplicates

use crate::error::{Error, Result};
use crate::types::*;
use serde::Serialize;

/// Maximum length of an application entry type name.
pub const MAX_TYPE_NAME_LEN: usize = 64;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Check an entry type name for canonical form.
pub fn validate_entry_type(entry_type: &EntryType) -> Result<()> {
    let name = match entry_type {
        EntryType::AgentId => return Ok(()),
        EntryType::App(name) => name,
    };
    if name.is_empty() {
        return Err(Error::InvalidEntryType("empty name".into()));
    }
    if name.len() > MAX_TYPE_NAME_LEN {
        return Err(Error::InvalidEntryType(format!(
            "name longer than {} bytes",
            MAX_TYPE_NAME_LEN
        )));
    }
    if !name.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(Error::InvalidEntryType(format!("{:?}", name)));
    }
    Ok(())
}

/// Check the structural invariants of an unsigned header.
///
/// seq 0 has no predecessor and carries the agent id; every later seq has one.
pub fn validate_header_shape(unsigned: &HeaderUnsigned) -> Result<()> {
    validate_entry_type(&unsigned.entry_type)?;
    match (unsigned.seq, &unsigned.prev_header) {
        (0, Some(_)) => Err(Error::MalformedHeader(
            "genesis header links a predecessor".into(),
        )),
        (0, None) if unsigned.entry_type != EntryType::AgentId => Err(Error::MalformedHeader(
            "genesis header must carry the agent id".into(),
        )),
        (seq, None) if seq > 0 => Err(Error::MalformedHeader(format!(
            "header at seq {} has no predecessor",
            seq
        ))),
        (seq, Some(_)) if seq > 0 && unsigned.entry_type == EntryType::AgentId => Err(
            Error::MalformedHeader(format!("agent id entry at seq {}", seq)),
        ),
        _ => Ok(()),
    }
}

/// Check that headers are in chain order: strictly ascending seq.
pub fn validate_chain_sorted(headers: &[Header]) -> Result<()> {
    for i in 1..headers.len() {
        if headers[i].seq() <= headers[i - 1].seq() {
            return Err(Error::MalformedHeader(format!(
                "chain not sorted at seq {}",
                headers[i].seq()
            )));
        }
    }
    Ok(())
}
