//! chainhold Core Library
//!
//! This crate provides the core types, canonical encoding, and cryptographic
//! primitives for chainhold: per-author hash chains of signed headers over
//! immutable, content-addressed entries.
//!
//! # Modules
//!
//! - [`types`]: Entries, headers, validation packages, gossip digests
//! - [`canonical`]: Deterministic serialization for hashing/signing
//! - [`crypto`]: Content addressing and header signatures
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use types::*;
