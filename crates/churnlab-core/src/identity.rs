//! Identity provisioning.
//!
//! An [`Identity`] is an Ed25519 keypair plus the network-visible
//! [`Address`] derived from it. Identities are ephemeral: one per role per
//! run, never persisted.

use std::fmt;

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};

const ADDRESS_BYTES: usize = 20;

/// Network-visible identity handle (`0x` + 40 lowercase hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Parse an externally supplied address, normalising it to lowercase.
    pub fn parse(raw: &str) -> HarnessResult<Self> {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| HarnessError::InvalidAddress(format!("missing 0x prefix: {trimmed}")))?;
        if body.len() != ADDRESS_BYTES * 2 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HarnessError::InvalidAddress(format!(
                "expected {} hex chars: {trimmed}",
                ADDRESS_BYTES * 2
            )));
        }
        Ok(Address(format!("0x{}", body.to_ascii_lowercase())))
    }

    fn from_public_key(public: &[u8]) -> Self {
        let digest = Sha256::digest(public);
        Address(format!("0x{}", hex::encode(&digest[..ADDRESS_BYTES])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (`0x` + first 8 hex chars) for log lines.
    pub fn short(&self) -> &str {
        self.0
            .char_indices()
            .nth(10)
            .map_or(&self.0[..], |(i, _)| &self.0[..i])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message-signing capability handed to the messaging client.
pub trait Signer: Send + Sync {
    fn address(&self) -> &Address;

    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// Ephemeral keypair-backed identity.
#[derive(Clone)]
pub struct Identity {
    address: Address,
    key: SigningKey,
}

impl Identity {
    /// Generate a fresh identity from the OS entropy source.
    ///
    /// Entropy failure is the only error and is not retried.
    pub fn generate() -> HarnessResult<Self> {
        let mut secret = [0u8; ed25519_dalek::SECRET_KEY_LENGTH];
        OsRng
            .try_fill_bytes(&mut secret)
            .map_err(|e| HarnessError::Fatal(format!("entropy source failed: {e}")))?;
        Ok(Self::from_secret(&secret))
    }

    /// Build an identity from a fixed secret (deterministic tests).
    pub fn from_secret(secret: &[u8; ed25519_dalek::SECRET_KEY_LENGTH]) -> Self {
        let key = SigningKey::from_bytes(secret);
        let address = Address::from_public_key(key.verifying_key().as_bytes());
        Self { address, key }
    }

    /// Check a signature produced by [`Signer::sign`].
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.key
            .verifying_key()
            .verify(message, &signature)
            .is_ok()
    }
}

impl Signer for Identity {
    fn address(&self) -> &Address {
        &self.address
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Create a fresh identity for `role` ("sender", "receiver").
pub fn create_identity(role: &str) -> HarnessResult<Identity> {
    let identity = Identity::generate()?;
    debug!(role = %role, address = %identity.address(), "identity generated");
    Ok(identity)
}
