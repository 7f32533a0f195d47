//! Response topic derivation and cached agreement keys.
//!
//! `generate_agreement_keys_if_needed` is compute-or-fetch keyed by
//! `(counterparty, account)`: the first call generates an ephemeral key pair,
//! performs the agreement and registers the shared key under the response
//! topic; later calls return the cached result untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{derive_topic, AgreementPublicKey, KeyManagementService};
use crate::{Account, AuthKitError, Result, Topic};

/// Outcome of an agreement with a counterparty for a given account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgreementSession {
    /// Topic the counterparty replies on: sha256(shared key).
    pub response_topic: Topic,
    /// Local ephemeral public key, sent to the counterparty in `type1` envelopes.
    pub self_public_key: AgreementPublicKey,
}

/// Derives response topics and owns the per-(counterparty, account) key cache.
pub struct KeyAgreementService {
    kms: Arc<KeyManagementService>,
    sessions: Mutex<HashMap<(AgreementPublicKey, Account), AgreementSession>>,
}

impl KeyAgreementService {
    pub fn new(kms: Arc<KeyManagementService>) -> Self {
        Self {
            kms,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Topic addressed by a counterparty's raw public key.
    ///
    /// Pure: the same key always yields the same topic.
    pub fn derive_response_topic(counterparty_public_key: &[u8]) -> Topic {
        derive_topic(counterparty_public_key)
    }

    /// Return the cached agreement with `counterparty_public_key` for
    /// `account`, creating it on first use.
    ///
    /// # Errors
    ///
    /// `KeyAgreement` if the counterparty key is not 32 bytes or is a
    /// low-order point.
    pub fn generate_agreement_keys_if_needed(
        &self,
        counterparty_public_key: &[u8],
        account: &Account,
    ) -> Result<AgreementSession> {
        let peer = AgreementPublicKey::from_slice(counterparty_public_key)?;
        let cache_key = (peer, account.clone());

        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| AuthKitError::Internal("agreement cache lock poisoned".into()))?;
        if let Some(session) = sessions.get(&cache_key) {
            return Ok(session.clone());
        }

        let self_public_key = self.kms.create_key_pair()?;
        let keys = match self.kms.perform_key_agreement(&self_public_key, &peer) {
            Ok(keys) => keys,
            Err(e) => {
                self.kms.delete_private_key(&self_public_key)?;
                return Err(e);
            }
        };
        let response_topic = keys.derived_topic();
        self.kms
            .set_symmetric_key(keys.shared_key.clone(), response_topic.clone())?;

        tracing::debug!(
            topic = %response_topic,
            counterparty = %peer,
            account = %account,
            "generated agreement keys"
        );

        let session = AgreementSession {
            response_topic,
            self_public_key,
        };
        sessions.insert(cache_key, session.clone());
        Ok(session)
    }

    /// Cached agreement, if one exists.
    pub fn cached(
        &self,
        counterparty: &AgreementPublicKey,
        account: &Account,
    ) -> Result<Option<AgreementSession>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| AuthKitError::Internal("agreement cache lock poisoned".into()))?;
        Ok(sessions.get(&(*counterparty, account.clone())).cloned())
    }

    /// Keychain backing the agreements.
    pub fn kms(&self) -> &Arc<KeyManagementService> {
        &self.kms
    }
}
