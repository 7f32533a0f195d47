//! Identity keys and `did:key` identifiers.
//!
//! Each account signs its assertions with an Ed25519 identity key. The public
//! half is published as a `did:key`:
//!
//! ```text
//! did:key:f ed01 <32 bytes public key>
//!         ^ ^^^^
//!         | multicodec ed25519-pub
//!         multibase base16 (lowercase)
//! ```

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::{Account, AuthKitError, Result};

/// `did:key` method prefix.
pub const DID_KEY_PREFIX: &str = "did:key:";

/// Multibase prefix for lowercase base16.
const MULTIBASE_BASE16: char = 'f';

/// Multicodec varint for ed25519 public keys.
const MULTICODEC_ED25519_PUB: [u8; 2] = [0xed, 0x01];

/// An Ed25519 public key addressed as a `did:key`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DidKey(VerifyingKey);

impl DidKey {
    pub fn new(key: VerifyingKey) -> Self {
        Self(key)
    }

    /// Parse a `did:key:f...` identifier.
    pub fn parse(did: &str) -> Result<Self> {
        let encoded = did
            .strip_prefix(DID_KEY_PREFIX)
            .and_then(|rest| rest.strip_prefix(MULTIBASE_BASE16))
            .ok_or_else(|| AuthKitError::malformed("did:key", format!("unsupported form: {}", did)))?;
        let bytes =
            hex::decode(encoded).map_err(|e| AuthKitError::malformed("did:key", e.to_string()))?;
        let key = bytes
            .strip_prefix(&MULTICODEC_ED25519_PUB[..])
            .ok_or_else(|| AuthKitError::malformed("did:key", "not an ed25519 key"))?;
        Self::from_slice(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AuthKitError::malformed("ed25519 public key", "expected 32 bytes"))?;
        VerifyingKey::from_bytes(&bytes)
            .map(Self)
            .map_err(|e| AuthKitError::malformed("ed25519 public key", e.to_string()))
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Check an Ed25519 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(sig) => self.0.verify(message, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

impl std::fmt::Display for DidKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            DID_KEY_PREFIX,
            MULTIBASE_BASE16,
            hex::encode(MULTICODEC_ED25519_PUB),
            self.to_hex()
        )
    }
}

/// Identity signing capability.
///
/// Implementations hold (or reach) the identity private keys; callers only
/// ever see signatures.
#[async_trait]
pub trait IdentitySigner: Send + Sync {
    /// Public identity key registered for `account`.
    async fn identity_key(&self, account: &Account) -> Result<DidKey>;

    /// Sign the canonical encoding of a claim set with the identity key of `account`.
    async fn sign(&self, message: &[u8], account: &Account) -> Result<Vec<u8>>;

    /// Verify a signed assertion against the key named by its issuer.
    async fn verify(&self, assertion: &str) -> Result<bool> {
        crate::jwt::verify_issuer_signature(assertion)
    }
}

/// Identity signer keeping Ed25519 keys in process memory.
#[derive(Default)]
pub struct LocalIdentitySigner {
    keys: RwLock<HashMap<Account, SigningKey>>,
}

impl LocalIdentitySigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an identity key for `account`, or return the existing one.
    pub fn register_identity(&self, account: &Account) -> Result<DidKey> {
        let mut keys = self
            .keys
            .write()
            .map_err(|_| AuthKitError::Storage("identity key lock poisoned".into()))?;
        let key = keys
            .entry(account.clone())
            .or_insert_with(|| SigningKey::generate(&mut rand::rngs::OsRng));
        Ok(DidKey(key.verifying_key()))
    }

    /// Install a known identity key for `account`.
    pub fn import_identity(&self, account: &Account, secret: [u8; 32]) -> Result<DidKey> {
        let key = SigningKey::from_bytes(&secret);
        let did = DidKey(key.verifying_key());
        self.keys
            .write()
            .map_err(|_| AuthKitError::Storage("identity key lock poisoned".into()))?
            .insert(account.clone(), key);
        Ok(did)
    }

    pub fn unregister_identity(&self, account: &Account) -> Result<()> {
        self.keys
            .write()
            .map_err(|_| AuthKitError::Storage("identity key lock poisoned".into()))?
            .remove(account);
        Ok(())
    }

    fn with_key<T>(&self, account: &Account, f: impl FnOnce(&SigningKey) -> T) -> Result<T> {
        let keys = self
            .keys
            .read()
            .map_err(|_| AuthKitError::Storage("identity key lock poisoned".into()))?;
        keys.get(account)
            .map(f)
            .ok_or_else(|| AuthKitError::Signing(format!("no identity key for {}", account)))
    }
}

#[async_trait]
impl IdentitySigner for LocalIdentitySigner {
    async fn identity_key(&self, account: &Account) -> Result<DidKey> {
        self.with_key(account, |key| DidKey(key.verifying_key()))
    }

    async fn sign(&self, message: &[u8], account: &Account) -> Result<Vec<u8>> {
        self.with_key(account, |key| key.sign(message).to_bytes().to_vec())
    }
}
