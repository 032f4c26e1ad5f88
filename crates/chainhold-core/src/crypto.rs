//! Content addressing and header signatures for chainhold
//!
//! All hash derivations use BLAKE3 with domain separation prefixes.
//! Header signatures are ed25519 over a domain-prefixed canonical encoding.

use crate::canonical::{canonical_bytes, validate_header_shape};
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for entry content addresses
pub const DOMAIN_ENTRY: &[u8] = b"entry";
/// Domain prefix for header addresses
pub const DOMAIN_HEADER: &[u8] = b"header";
/// Domain prefix for header signatures
pub const DOMAIN_HEADER_SIG: &[u8] = b"header-sig";

// =============================================================================
// ADDRESSES
// =============================================================================

/// Derive the content address of an entry.
///
/// `Address = BLAKE3("entry" || canonical_bytes(Entry))`
pub fn entry_address(entry: &Entry) -> Result<Address> {
    let bytes = canonical_bytes(entry)?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_ENTRY);
    hasher.update(&bytes);

    Ok(Address(*hasher.finalize().as_bytes()))
}

/// Derive the address of a header from its signed content.
///
/// `HeaderAddress = BLAKE3("header" || canonical_bytes(HeaderUnsigned))`
pub fn header_address(unsigned: &HeaderUnsigned) -> Result<HeaderAddress> {
    let bytes = canonical_bytes(unsigned)?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_HEADER);
    hasher.update(&bytes);

    Ok(HeaderAddress(*hasher.finalize().as_bytes()))
}

/// Verify that an entry hashes to the address its header claims.
pub fn verify_entry_address(entry: &Entry, header: &Header) -> Result<()> {
    let computed = entry_address(entry)?;
    if &computed != header.entry_address() {
        return Err(Error::HashMismatch {
            computed: hex::encode(computed.0),
            transmitted: hex::encode(header.entry_address().0),
        });
    }
    if &entry.entry_type != header.entry_type() {
        return Err(Error::MalformedHeader(format!(
            "entry type {} does not match header type {}",
            entry.entry_type,
            header.entry_type()
        )));
    }
    Ok(())
}

// =============================================================================
// SIGNATURES
// =============================================================================

/// Compute the bytes to sign for a header.
///
/// `sign_bytes = "header-sig" || canonical_bytes(HeaderUnsigned)`
pub fn header_sign_bytes(unsigned: &HeaderUnsigned) -> Result<Vec<u8>> {
    let unsigned_bytes = canonical_bytes(unsigned)?;

    let mut bytes = Vec::with_capacity(DOMAIN_HEADER_SIG.len() + unsigned_bytes.len());
    bytes.extend_from_slice(DOMAIN_HEADER_SIG);
    bytes.extend_from_slice(&unsigned_bytes);

    Ok(bytes)
}

/// Create a signed header.
///
/// The shape of the header (genesis/link invariants, type name) is checked
/// before signing so an author can never produce a malformed chain.
pub fn create_header(
    unsigned: HeaderUnsigned,
    sign_fn: impl FnOnce(&[u8]) -> Vec<u8>,
) -> Result<Header> {
    validate_header_shape(&unsigned)?;
    let sign_bytes = header_sign_bytes(&unsigned)?;
    let signature = sign_fn(&sign_bytes);

    Ok(Header {
        unsigned,
        signature,
    })
}

/// Verify a header's signature against the author key it claims.
pub fn verify_header_signature(header: &Header) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(&header.author().0)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
    let signature_bytes: [u8; 64] = header
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidSignature)?;
    let signature = Signature::from_bytes(&signature_bytes);
    let sign_bytes = header_sign_bytes(&header.unsigned)?;

    verifying_key
        .verify(&sign_bytes, &signature)
        .map_err(|_| Error::InvalidSignature)
}

/// Full standalone check of a header: shape and signature.
pub fn verify_header(header: &Header) -> Result<()> {
    validate_header_shape(&header.unsigned)?;
    verify_header_signature(header)
}
