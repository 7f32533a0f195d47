//! Test fixtures and data generators.

use ed25519_dalek::{Signer, SigningKey};

use crate::crypto::derive_topic;
use crate::identity::DidKey;
use crate::{Account, Topic};

/// Domain used by test apps and services.
pub const TEST_DOMAIN: &str = "app.example.com";

/// Namespace of accounts whose address is a hex Ed25519 public key.
const ED25519_NAMESPACE: &str = "ed25519";

/// An account backed by a deterministic Ed25519 key.
#[derive(Clone, Debug)]
pub struct TestAccount {
    pub account: Account,
    pub signing_key: SigningKey,
}

impl TestAccount {
    /// Deterministic account for `seed`.
    pub fn from_seed(seed: u8) -> Self {
        let signing_key = SigningKey::from_bytes(&[seed; 32]);
        let address = hex::encode(signing_key.verifying_key().as_bytes());
        let account = Account::parse(&format!("{}:1:{}", ED25519_NAMESPACE, address))
            .unwrap_or_else(|e| panic!("fixture account is valid: {}", e));
        Self {
            account,
            signing_key,
        }
    }

    pub fn did_key(&self) -> DidKey {
        DidKey::new(self.signing_key.verifying_key())
    }

    /// Hex Ed25519 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

/// Deterministic topic for `n`.
pub fn test_topic(n: u64) -> Topic {
    derive_topic(&n.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_fixture_is_deterministic() {
        let a = TestAccount::from_seed(1);
        let b = TestAccount::from_seed(1);
        assert_eq!(a.account, b.account);
        assert_eq!(a.account.namespace(), "ed25519");
        assert_eq!(a.account.address().len(), 64);
        assert!(a.did_key().verify(b"m", &hex::decode(a.sign(b"m")).unwrap()));
    }
}
