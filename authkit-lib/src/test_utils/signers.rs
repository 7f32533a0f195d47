use async_trait::async_trait;

use crate::identity::{DidKey, IdentitySigner};
use crate::{Account, AuthKitError, Result};

/// Identity signer whose key is always unavailable.
#[derive(Debug, Default)]
pub struct FailingSigner;

#[async_trait]
impl IdentitySigner for FailingSigner {
    async fn identity_key(&self, account: &Account) -> Result<DidKey> {
        Err(AuthKitError::Signing(format!(
            "identity key unavailable for {}",
            account
        )))
    }

    async fn sign(&self, _message: &[u8], account: &Account) -> Result<Vec<u8>> {
        Err(AuthKitError::Signing(format!("signing refused for {}", account)))
    }
}
