//! Relay envelopes.
//!
//! # Wire Format
//!
//! ```text
//! type0: [0x00][12 bytes nonce][N bytes ciphertext + 16 bytes tag]
//! type1: [0x01][32 bytes sender public key][12 bytes nonce][N bytes ciphertext + 16 bytes tag]
//! ```
//!
//! The framed bytes are base64 (standard alphabet) encoded before they are
//! handed to the relay. The envelope type is transport metadata; the JSON
//! body inside never names it.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;

use super::{AgreementPublicKey, SymmetricKey, KEY_SIZE};

/// Size of the nonce in bytes (96 bits).
const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes.
const TAG_SIZE: usize = 16;

/// Envelope errors.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Invalid base64 framing: {0}")]
    InvalidEncoding(String),
    #[error("Envelope too short ({0} bytes)")]
    Truncated(usize),
    #[error("Unsupported envelope type: {0}")]
    UnsupportedType(u8),
    #[error("Encryption failed")]
    EncryptFailed,
    #[error("Decryption failed: authentication tag mismatch")]
    DecryptFailed,
}

impl From<EnvelopeError> for crate::AuthKitError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::EncryptFailed => crate::AuthKitError::Internal(err.to_string()),
            other => crate::AuthKitError::Decode(other.to_string()),
        }
    }
}

/// Encoding/encryption mode of a relay message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    /// Sealed with the symmetric key already registered for the topic.
    Type0,
    /// Carries the sender's public key; the key is derived by agreement.
    Type1,
}

impl EnvelopeType {
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Type0 => 0,
            Self::Type1 => 1,
        }
    }
}

/// A parsed (still encrypted) envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub envelope_type: EnvelopeType,
    /// Sender public key, present for `type1` only.
    pub sender_public_key: Option<AgreementPublicKey>,
    pub nonce: [u8; NONCE_SIZE],
    pub sealed: Vec<u8>,
}

impl Envelope {
    /// Encrypt `plaintext` under `key` and frame it as `type0`.
    pub fn seal_type0(plaintext: &[u8], key: &SymmetricKey) -> Result<Self, EnvelopeError> {
        Self::seal(plaintext, key, EnvelopeType::Type0, None)
    }

    /// Encrypt `plaintext` under `key` and frame it as `type1` carrying `sender`.
    pub fn seal_type1(
        plaintext: &[u8],
        key: &SymmetricKey,
        sender: AgreementPublicKey,
    ) -> Result<Self, EnvelopeError> {
        Self::seal(plaintext, key, EnvelopeType::Type1, Some(sender))
    }

    fn seal(
        plaintext: &[u8],
        key: &SymmetricKey,
        envelope_type: EnvelopeType,
        sender_public_key: Option<AgreementPublicKey>,
    ) -> Result<Self, EnvelopeError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| EnvelopeError::EncryptFailed)?;

        Ok(Self {
            envelope_type,
            sender_public_key,
            nonce,
            sealed,
        })
    }

    /// Decrypt the envelope with `key`.
    pub fn open(&self, key: &SymmetricKey) -> Result<Vec<u8>, EnvelopeError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.sealed.as_slice())
            .map_err(|_| EnvelopeError::DecryptFailed)
    }

    /// Frame and base64-encode for the relay.
    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(1 + KEY_SIZE + NONCE_SIZE + self.sealed.len());
        bytes.push(self.envelope_type.as_byte());
        if let Some(sender) = &self.sender_public_key {
            bytes.extend_from_slice(sender.as_bytes());
        }
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.sealed);
        B64.encode(bytes)
    }

    /// Parse a relay message into an envelope.
    pub fn decode(message: &str) -> Result<Self, EnvelopeError> {
        let bytes = B64
            .decode(message.trim())
            .map_err(|e| EnvelopeError::InvalidEncoding(e.to_string()))?;

        let (&type_byte, rest) = bytes.split_first().ok_or(EnvelopeError::Truncated(0))?;
        let (envelope_type, sender_public_key, rest) = match type_byte {
            0 => (EnvelopeType::Type0, None, rest),
            1 => {
                if rest.len() < KEY_SIZE {
                    return Err(EnvelopeError::Truncated(bytes.len()));
                }
                let (key, rest) = rest.split_at(KEY_SIZE);
                let mut sender = [0u8; KEY_SIZE];
                sender.copy_from_slice(key);
                (
                    EnvelopeType::Type1,
                    Some(AgreementPublicKey::from_bytes(sender)),
                    rest,
                )
            }
            other => return Err(EnvelopeError::UnsupportedType(other)),
        };

        if rest.len() < NONCE_SIZE + TAG_SIZE {
            return Err(EnvelopeError::Truncated(bytes.len()));
        }
        let (nonce_bytes, sealed) = rest.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);

        Ok(Self {
            envelope_type,
            sender_public_key,
            nonce,
            sealed: sealed.to_vec(),
        })
    }
}
