//! Key material, topic derivation and envelope sealing.
//!
//! # Security Properties
//!
//! - **Topics**: sha256 of the key material they address (public key or symmetric key)
//! - **Key Agreement**: X25519, the raw shared secret expanded with HKDF-SHA256
//! - **Envelopes**: ChaCha20-Poly1305 with random 96-bit nonces
//! - **Zeroization**: symmetric keys are wiped from memory on drop

use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{AuthKitError, Result, Topic};

pub mod agreement;
pub mod envelope;
pub mod kms;

pub use agreement::{AgreementSession, KeyAgreementService};
pub use envelope::{Envelope, EnvelopeType};
pub use kms::{KeyManagementService, OpenedEnvelope};

/// Size of X25519 public keys and of symmetric keys.
pub const KEY_SIZE: usize = 32;

/// Derive the relay topic addressing the given key material.
///
/// Pure function: sha256 over the raw bytes, hex encoded.
pub fn derive_topic(key_material: &[u8]) -> Topic {
    let digest: [u8; 32] = Sha256::digest(key_material).into();
    Topic::from_digest(digest)
}

/// A 256-bit symmetric key used for `type0`/`type1` envelopes.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Generate a random key from the OS source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a hex-encoded key (as carried in pairing URIs).
    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value)
            .map_err(|e| AuthKitError::malformed("symmetric key", e.to_string()))?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
            AuthKitError::malformed(
                "symmetric key",
                format!("expected {} bytes, got {}", KEY_SIZE, v.len()),
            )
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Topic addressed by this key: sha256(key).
    pub fn derived_topic(&self) -> Topic {
        derive_topic(&self.0)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// An X25519 public key used for key agreement.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgreementPublicKey([u8; KEY_SIZE]);

impl AgreementPublicKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse raw key bytes, failing with `KeyAgreement` on a wrong length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            AuthKitError::KeyAgreement(format!(
                "public key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Parse a hex-encoded key, failing with `KeyAgreement` on bad material.
    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value)
            .map_err(|e| AuthKitError::KeyAgreement(format!("invalid public key hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Topic derived from this public key: sha256(public key).
    pub fn derived_topic(&self) -> Topic {
        derive_topic(&self.0)
    }
}

impl std::fmt::Debug for AgreementPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AgreementPublicKey({})", self.to_hex())
    }
}

impl std::fmt::Display for AgreementPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl serde::Serialize for AgreementPublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for AgreementPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// Result of an X25519 agreement between a local key pair and a peer key.
#[derive(Clone, Debug)]
pub struct AgreementKeys {
    /// HKDF-SHA256 expansion of the raw shared secret.
    pub shared_key: SymmetricKey,
    /// Local public key that took part in the agreement.
    pub public_key: AgreementPublicKey,
}

impl AgreementKeys {
    /// Topic addressed by the shared key: sha256(shared key).
    pub fn derived_topic(&self) -> Topic {
        self.shared_key.derived_topic()
    }
}

/// Expand a raw X25519 shared secret into a symmetric key.
pub(crate) fn expand_shared_secret(raw: &[u8; KEY_SIZE]) -> Result<SymmetricKey> {
    let hk = Hkdf::<Sha256>::new(None, raw);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(&[], &mut okm)
        .map_err(|e| AuthKitError::KeyAgreement(format!("key derivation failed: {}", e)))?;
    Ok(SymmetricKey(okm))
}
