//! Agent keypairs
//!
//! A node's signing key is both its network identity and the author key of
//! its source chain.

use chainhold_core::crypto::create_header;
use chainhold_core::{AgentKey, Header, HeaderUnsigned};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
    #[error("Header creation failed: {0}")]
    Header(#[from] chainhold_core::Error),
}

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic testing and restarts)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Seed bytes, for persisting the identity
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Public key as an author identity
    pub fn agent_key(&self) -> AgentKey {
        AgentKey(self.public_key())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Sign a header authored by this keypair
    pub fn sign_header(&self, unsigned: HeaderUnsigned) -> Result<Header, CryptoError> {
        if unsigned.author != self.agent_key() {
            return Err(CryptoError::SignatureVerificationFailed);
        }
        Ok(create_header(unsigned, |bytes| self.sign(bytes).to_vec())?)
    }

    /// Verify a signature
    pub fn verify(
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8; 64],
    ) -> Result<(), CryptoError> {
        let verifying_key =
            VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::InvalidKeyLength)?;
        let sig = Signature::from_bytes(signature);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.agent_key())
            .finish_non_exhaustive()
    }
}
