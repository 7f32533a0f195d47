//! DID/domain resolution interface.
//!
//! Network resolution of `did.json` documents lives outside this crate; the
//! protocol only needs the two keys a service publishes.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::crypto::AgreementPublicKey;
use crate::identity::DidKey;
use crate::{AuthKitError, Result};

/// Keys a service publishes for a domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceKeys {
    /// X25519 key used for `type1` first-contact requests.
    pub agreement: AgreementPublicKey,
    /// Ed25519 key that signs the service's responses.
    pub authentication: DidKey,
}

#[async_trait]
pub trait DidResolver: Send + Sync {
    async fn resolve_agreement_key(&self, domain: &str) -> Result<AgreementPublicKey>;

    async fn resolve_authentication_key(&self, domain: &str) -> Result<DidKey>;
}

/// Resolver answering from a fixed table.
#[derive(Default)]
pub struct StaticDidResolver {
    services: RwLock<HashMap<String, ServiceKeys>>,
}

impl StaticDidResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, domain: impl Into<String>, keys: ServiceKeys) -> Result<()> {
        self.services
            .write()
            .map_err(|_| AuthKitError::Storage("resolver lock poisoned".into()))?
            .insert(domain.into(), keys);
        Ok(())
    }

    fn lookup(&self, domain: &str) -> Result<ServiceKeys> {
        self.services
            .read()
            .map_err(|_| AuthKitError::Storage("resolver lock poisoned".into()))?
            .get(domain)
            .copied()
            .ok_or_else(|| AuthKitError::not_found("did document", domain))
    }
}

#[async_trait]
impl DidResolver for StaticDidResolver {
    async fn resolve_agreement_key(&self, domain: &str) -> Result<AgreementPublicKey> {
        Ok(self.lookup(domain)?.agreement)
    }

    async fn resolve_authentication_key(&self, domain: &str) -> Result<DidKey> {
        Ok(self.lookup(domain)?.authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    #[tokio::test]
    async fn test_static_resolver_lookup() {
        let resolver = StaticDidResolver::new();
        let keys = ServiceKeys {
            agreement: AgreementPublicKey::from_bytes([1u8; 32]),
            authentication: DidKey::new(SigningKey::from_bytes(&[2u8; 32]).verifying_key()),
        };
        resolver.insert("notify.example.com", keys).unwrap();

        assert_eq!(
            resolver.resolve_agreement_key("notify.example.com").await.unwrap(),
            keys.agreement
        );
        assert_eq!(
            resolver
                .resolve_authentication_key("notify.example.com")
                .await
                .unwrap(),
            keys.authentication
        );
        assert!(resolver.resolve_agreement_key("unknown.example.com").await.is_err());
    }
}
