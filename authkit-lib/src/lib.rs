//! AuthKit library.
//!
//! Leaf components of the pairing-scoped authentication protocol. The crate
//! stays free of socket and disk concerns and delegates them to callers
//! through trait-based dependency injection:
//!
//! - **Key agreement**: X25519 agreement, topic derivation and `type0`/`type1` envelopes
//! - **Identity**: Ed25519 identity keys, `did:key` identifiers and JWT assertions
//! - **Pairings**: pairing URI codec and the pairing registry
//! - **Pending requests**: store of requests awaiting a response
//! - **Relay**: publish/subscribe transport interface plus an in-process relay
//!
//! # Example
//!
//! ```
//! use authkit_lib::crypto::derive_topic;
//!
//! let topic = derive_topic(&[7u8; 32]);
//! assert_eq!(topic.as_str().len(), 64);
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub mod auth_payload;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod identity;
pub mod jwt;
pub mod pairing;
pub mod pending;
pub mod prelude;
pub mod resolver;
pub mod transport;
pub mod uri;

/// Test doubles for downstream protocol tests.
///
/// This module is only available with the `test-utils` feature or in test builds.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use errors::{AuthKitError, AuthKitErrorCode};
pub use uri::PairingUri;

/// Common result alias for AuthKit operations.
pub type Result<T> = std::result::Result<T, AuthKitError>;

/// Length in hex characters of a topic (sha256 digest).
pub const TOPIC_HEX_LEN: usize = 64;

/// Addressing key of a logical channel on the relay.
///
/// Always a lowercase hex-encoded sha256 digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Parse a topic from its hex form.
    pub fn from_hex(value: &str) -> Result<Self> {
        if value.len() != TOPIC_HEX_LEN || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AuthKitError::malformed(
                "topic",
                format!("expected {} hex characters, got {:?}", TOPIC_HEX_LEN, value),
            ));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    /// Build a topic from a 32-byte digest.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(hex::encode(digest))
    }

    /// Get the topic as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Topic {
    type Error = AuthKitError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A CAIP-10 blockchain account: `namespace:reference:address`.
///
/// # Example
///
/// ```
/// use authkit_lib::Account;
///
/// let account = Account::parse("eip155:1:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb").unwrap();
/// assert_eq!(account.namespace(), "eip155");
/// assert!(account.did_pkh().starts_with("did:pkh:eip155:1:"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Account {
    namespace: String,
    reference: String,
    address: String,
}

impl Account {
    /// Prefix used when an account is rendered as a DID subject.
    pub const DID_PKH_PREFIX: &'static str = "did:pkh:";

    /// Parse a CAIP-10 account string.
    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.splitn(3, ':');
        let (namespace, reference, address) = match (parts.next(), parts.next(), parts.next()) {
            (Some(n), Some(r), Some(a)) if !n.is_empty() && !r.is_empty() && !a.is_empty() => {
                (n, r, a)
            }
            _ => {
                return Err(AuthKitError::malformed(
                    "account",
                    format!("expected namespace:reference:address, got {:?}", value),
                ))
            }
        };
        if address.contains(':') {
            return Err(AuthKitError::malformed("account", "address contains ':'"));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            reference: reference.to_string(),
            address: address.to_string(),
        })
    }

    /// Parse an account from a `did:pkh:` subject.
    pub fn from_did_pkh(did: &str) -> Result<Self> {
        let stripped = did
            .strip_prefix(Self::DID_PKH_PREFIX)
            .ok_or_else(|| AuthKitError::malformed("did:pkh", format!("missing prefix: {}", did)))?;
        Self::parse(stripped)
    }

    /// CAIP-2 chain identifier (`namespace:reference`).
    pub fn chain_id(&self) -> String {
        format!("{}:{}", self.namespace, self.reference)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Render as a `did:pkh:` subject.
    pub fn did_pkh(&self) -> String {
        format!("{}{}", Self::DID_PKH_PREFIX, self)
    }
}

impl TryFrom<String> for Account {
    type Error = AuthKitError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Account> for String {
    fn from(account: Account) -> Self {
        account.to_string()
    }
}

impl std::fmt::Display for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.reference, self.address)
    }
}

/// JSON-RPC request identifier.
///
/// Generated as `unix_millis * 1000 + random(0..1000)`, bumped past the last
/// id handed out by this process so ids stay strictly increasing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcId(pub u64);

impl RpcId {
    /// Generate a fresh request identifier.
    pub fn generate() -> Self {
        static LAST: AtomicU64 = AtomicU64::new(0);

        let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let jitter: u64 = rand::thread_rng().gen_range(0..1000);
        let candidate = millis * 1000 + jitter;
        let previous = LAST
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(candidate.max(last + 1))
            })
            .unwrap_or_default();
        Self(candidate.max(previous + 1))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_validation() {
        assert!(Topic::from_hex(&"a".repeat(64)).is_ok());
        assert!(Topic::from_hex("abc").is_err());
        assert!(Topic::from_hex(&"z".repeat(64)).is_err());
        assert_eq!(
            Topic::from_hex(&"AB".repeat(32)).unwrap().as_str(),
            "ab".repeat(32)
        );
    }

    #[test]
    fn test_account_roundtrip_via_did_pkh() {
        let account = Account::parse("eip155:1:0xabc").unwrap();
        let did = account.did_pkh();
        assert_eq!(did, "did:pkh:eip155:1:0xabc");
        assert_eq!(Account::from_did_pkh(&did).unwrap(), account);
        assert_eq!(account.chain_id(), "eip155:1");
    }

    #[test]
    fn test_account_rejects_malformed() {
        assert!(Account::parse("eip155:1").is_err());
        assert!(Account::parse("::").is_err());
        assert!(Account::from_did_pkh("did:key:abc").is_err());
    }

    #[test]
    fn test_rpc_ids_are_unique_in_burst() {
        let ids: Vec<_> = (0..1000).map(|_| RpcId::generate()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
