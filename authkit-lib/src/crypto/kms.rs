//! Key management service (keychain).
//!
//! Holds every secret the protocol needs to seal and open envelopes:
//!
//! - symmetric keys, indexed by the topic they protect
//! - X25519 private keys, indexed by their public key
//! - the local public key expected to receive `type1` envelopes on a topic
//!
//! # Thread Safety
//!
//! All maps sit behind `RwLock`s. Lock poisoning is reported as a
//! `Storage` error rather than a panic.

use std::collections::HashMap;
use std::sync::RwLock;

use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::envelope::{Envelope, EnvelopeType};
use super::{expand_shared_secret, AgreementKeys, AgreementPublicKey, SymmetricKey};
use crate::{AuthKitError, Result, Topic};

fn lock_error(context: &str) -> AuthKitError {
    AuthKitError::Storage(format!("KeyManagementService: lock poisoned during {}", context))
}

/// Plaintext recovered from an envelope, with its framing metadata.
#[derive(Clone, Debug)]
pub struct OpenedEnvelope {
    pub plaintext: Vec<u8>,
    pub envelope_type: EnvelopeType,
    /// Sender public key of a `type1` envelope.
    pub sender_public_key: Option<AgreementPublicKey>,
}

/// In-memory keychain shared by the dispatcher and the correlator.
#[derive(Default)]
pub struct KeyManagementService {
    symmetric_keys: RwLock<HashMap<Topic, SymmetricKey>>,
    private_keys: RwLock<HashMap<AgreementPublicKey, StaticSecret>>,
    receiving_keys: RwLock<HashMap<Topic, AgreementPublicKey>>,
}

impl KeyManagementService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh symmetric key and register it under its derived topic.
    pub fn create_symmetric_key(&self) -> Result<(Topic, SymmetricKey)> {
        let key = SymmetricKey::generate();
        let topic = key.derived_topic();
        self.set_symmetric_key(key.clone(), topic.clone())?;
        Ok((topic, key))
    }

    pub fn set_symmetric_key(&self, key: SymmetricKey, topic: Topic) -> Result<()> {
        self.symmetric_keys
            .write()
            .map_err(|_| lock_error("set_symmetric_key"))?
            .insert(topic, key);
        Ok(())
    }

    pub fn symmetric_key(&self, topic: &Topic) -> Result<Option<SymmetricKey>> {
        Ok(self
            .symmetric_keys
            .read()
            .map_err(|_| lock_error("symmetric_key"))?
            .get(topic)
            .cloned())
    }

    pub fn delete_symmetric_key(&self, topic: &Topic) -> Result<()> {
        self.symmetric_keys
            .write()
            .map_err(|_| lock_error("delete_symmetric_key"))?
            .remove(topic);
        Ok(())
    }

    /// Generate an ephemeral X25519 key pair and keep its private half.
    pub fn create_key_pair(&self) -> Result<AgreementPublicKey> {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = AgreementPublicKey::from_bytes(X25519PublicKey::from(&secret).to_bytes());
        self.private_keys
            .write()
            .map_err(|_| lock_error("create_key_pair"))?
            .insert(public, secret);
        Ok(public)
    }

    pub fn has_private_key(&self, public_key: &AgreementPublicKey) -> Result<bool> {
        Ok(self
            .private_keys
            .read()
            .map_err(|_| lock_error("has_private_key"))?
            .contains_key(public_key))
    }

    pub fn delete_private_key(&self, public_key: &AgreementPublicKey) -> Result<()> {
        self.private_keys
            .write()
            .map_err(|_| lock_error("delete_private_key"))?
            .remove(public_key);
        Ok(())
    }

    /// Declare that `type1` envelopes arriving on `topic` are addressed to `public_key`.
    pub fn set_receiving_key(&self, topic: Topic, public_key: AgreementPublicKey) -> Result<()> {
        self.receiving_keys
            .write()
            .map_err(|_| lock_error("set_receiving_key"))?
            .insert(topic, public_key);
        Ok(())
    }

    pub fn receiving_key(&self, topic: &Topic) -> Result<Option<AgreementPublicKey>> {
        Ok(self
            .receiving_keys
            .read()
            .map_err(|_| lock_error("receiving_key"))?
            .get(topic)
            .copied())
    }

    /// X25519 agreement between a local key pair and a peer public key.
    pub fn perform_key_agreement(
        &self,
        self_public_key: &AgreementPublicKey,
        peer_public_key: &AgreementPublicKey,
    ) -> Result<AgreementKeys> {
        let private_keys = self
            .private_keys
            .read()
            .map_err(|_| lock_error("perform_key_agreement"))?;
        let secret = private_keys
            .get(self_public_key)
            .ok_or_else(|| AuthKitError::not_found("private key", self_public_key.to_hex()))?;

        let peer = X25519PublicKey::from(*peer_public_key.as_bytes());
        let raw = secret.diffie_hellman(&peer);
        if !raw.was_contributory() {
            return Err(AuthKitError::KeyAgreement(
                "peer public key is a low-order point".into(),
            ));
        }

        Ok(AgreementKeys {
            shared_key: expand_shared_secret(raw.as_bytes())?,
            public_key: *self_public_key,
        })
    }

    /// Seal `plaintext` for `topic` using the topic's symmetric key.
    pub fn seal(&self, topic: &Topic, plaintext: &[u8], envelope_type: EnvelopeType) -> Result<String> {
        let key = self
            .symmetric_key(topic)?
            .ok_or_else(|| AuthKitError::not_found("symmetric key", topic.as_str()))?;
        let envelope = match envelope_type {
            EnvelopeType::Type0 => Envelope::seal_type0(plaintext, &key)?,
            EnvelopeType::Type1 => {
                return Err(AuthKitError::Internal(
                    "type1 envelopes are sealed with agreement keys".into(),
                ))
            }
        };
        Ok(envelope.encode())
    }

    /// Seal `plaintext` as `type1` with an agreement result.
    pub fn seal_with_agreement(&self, plaintext: &[u8], keys: &AgreementKeys) -> Result<String> {
        Ok(Envelope::seal_type1(plaintext, &keys.shared_key, keys.public_key)?.encode())
    }

    /// Open a relay message received on `topic`.
    ///
    /// `type0` uses the topic's symmetric key; `type1` derives the key from
    /// the receiving key registered for the topic and the embedded sender key.
    pub fn open(&self, topic: &Topic, message: &str) -> Result<OpenedEnvelope> {
        let envelope = Envelope::decode(message)?;
        let key = match envelope.sender_public_key {
            None => self
                .symmetric_key(topic)?
                .ok_or_else(|| AuthKitError::not_found("symmetric key", topic.as_str()))?,
            Some(sender) => {
                let receiving = self
                    .receiving_key(topic)?
                    .ok_or_else(|| AuthKitError::not_found("receiving key", topic.as_str()))?;
                self.perform_key_agreement(&receiving, &sender)?.shared_key
            }
        };

        Ok(OpenedEnvelope {
            plaintext: envelope.open(&key)?,
            envelope_type: envelope.envelope_type,
            sender_public_key: envelope.sender_public_key,
        })
    }
}

impl std::fmt::Debug for KeyManagementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManagementService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_is_symmetric() {
        let alice = KeyManagementService::new();
        let bob = KeyManagementService::new();

        let alice_pk = alice.create_key_pair().unwrap();
        let bob_pk = bob.create_key_pair().unwrap();

        let a = alice.perform_key_agreement(&alice_pk, &bob_pk).unwrap();
        let b = bob.perform_key_agreement(&bob_pk, &alice_pk).unwrap();

        assert_eq!(a.shared_key, b.shared_key);
        assert_eq!(a.derived_topic(), b.derived_topic());
    }

    #[test]
    fn test_type0_roundtrip_through_topic_key() {
        let sender = KeyManagementService::new();
        let receiver = KeyManagementService::new();

        let (topic, key) = sender.create_symmetric_key().unwrap();
        receiver.set_symmetric_key(key, topic.clone()).unwrap();

        let sealed = sender.seal(&topic, b"ping", EnvelopeType::Type0).unwrap();
        let opened = receiver.open(&topic, &sealed).unwrap();
        assert_eq!(opened.plaintext, b"ping");
        assert_eq!(opened.envelope_type, EnvelopeType::Type0);
    }

    #[test]
    fn test_type1_roundtrip_through_receiving_key() {
        let app = KeyManagementService::new();
        let wallet = KeyManagementService::new();

        let app_pk = app.create_key_pair().unwrap();
        let response_topic = app_pk.derived_topic();
        app.set_receiving_key(response_topic.clone(), app_pk).unwrap();

        let wallet_pk = wallet.create_key_pair().unwrap();
        let keys = wallet.perform_key_agreement(&wallet_pk, &app_pk).unwrap();
        let sealed = wallet.seal_with_agreement(b"pong", &keys).unwrap();

        let opened = app.open(&response_topic, &sealed).unwrap();
        assert_eq!(opened.plaintext, b"pong");
        assert_eq!(opened.sender_public_key, Some(wallet_pk));
    }

    #[test]
    fn test_open_without_key_is_not_found() {
        let kms = KeyManagementService::new();
        let other = KeyManagementService::new();
        let (topic, _) = other.create_symmetric_key().unwrap();
        let sealed = other.seal(&topic, b"x", EnvelopeType::Type0).unwrap();

        let err = kms.open(&topic, &sealed).unwrap_err();
        assert_eq!(err.code(), crate::AuthKitErrorCode::NotFound);
    }

    #[test]
    fn test_low_order_peer_key_rejected() {
        let kms = KeyManagementService::new();
        let pk = kms.create_key_pair().unwrap();
        let err = kms
            .perform_key_agreement(&pk, &AgreementPublicKey::from_bytes([0u8; 32]))
            .unwrap_err();
        assert_eq!(err.code(), crate::AuthKitErrorCode::KeyAgreement);
    }
}
