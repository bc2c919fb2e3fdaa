//! Identity key generation, serialization and fingerprints.
//!
//! Each device has a long-term Curve25519 identity key pair generated at
//! bootstrap and persisted in the key-value store.

use libsignal_protocol::{IdentityKey, IdentityKeyPair, KeyPair};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::Result;

/// A serializable wrapper around libsignal's IdentityKeyPair.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SerializableIdentityKeyPair {
    /// Serialized Curve25519 public key (type byte + 32 bytes).
    pub public_key: Vec<u8>,
    /// 32-byte Curve25519 private key.
    pub private_key: Vec<u8>,
}

impl SerializableIdentityKeyPair {
    pub fn to_identity_key_pair(&self) -> Result<IdentityKeyPair> {
        let key_pair = KeyPair::from_public_and_private(&self.public_key, &self.private_key)?;
        Ok(IdentityKeyPair::new(
            IdentityKey::new(key_pair.public_key),
            key_pair.private_key,
        ))
    }

    pub fn from_identity_key_pair(pair: &IdentityKeyPair) -> Self {
        Self {
            public_key: pair.public_key().serialize().to_vec(),
            private_key: pair.private_key().serialize().to_vec(),
        }
    }
}

pub fn generate_identity_key_pair() -> IdentityKeyPair {
    IdentityKeyPair::generate(&mut OsRng)
}

/// Human-comparable fingerprint of a serialized identity public key:
/// lowercase hex of the 32 key bytes, in space-separated blocks of 8.
pub fn fingerprint(public_key: &[u8]) -> String {
    // Drop the leading key-type byte of a serialized Curve25519 key.
    let raw = match public_key {
        [0x05, rest @ ..] if rest.len() == 32 => rest,
        other => other,
    };
    let hex = hex::encode(raw);
    hex.as_bytes()
        .chunks(8)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
