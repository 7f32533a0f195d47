//! Error types for AuthKit operations.
//!
//! This module provides structured error types for the leaf components,
//! enabling precise error handling at the protocol layer.

use std::fmt;

/// Numeric error codes for FFI and host-application integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AuthKitErrorCode {
    /// Malformed caller input (URI, key bytes, identifiers)
    MalformedInput = 1000,
    /// Invalid counterparty key material
    KeyAgreement = 2000,
    /// Identity signing unavailable or failed
    Signing = 3000,
    /// Inbound payload could not be decoded
    Decode = 4000,
    /// Relay transport error
    Transport = 5000,
    /// Storage error
    Storage = 6000,
    /// Serialization error
    Serialization = 7000,
    /// Resource not found
    NotFound = 8000,
    /// Internal/unexpected error
    Internal = 9999,
}

/// Error type for leaf AuthKit operations.
#[derive(Debug)]
pub enum AuthKitError {
    /// Caller input was rejected before any I/O took place.
    MalformedInput {
        /// Field or parameter name
        field: String,
        /// Reason for rejection
        reason: String,
    },

    /// Counterparty key material is invalid (wrong length, bad encoding).
    KeyAgreement(String),

    /// The identity key is unavailable or the signature could not be produced.
    Signing(String),

    /// An inbound payload could not be decrypted or parsed.
    Decode(String),

    /// Relay transport failure.
    Transport(String),

    /// Storage operation failed.
    Storage(String),

    /// Serialization/deserialization error.
    Serialization(String),

    /// Resource not found (symmetric key, private key, pairing, ...).
    NotFound {
        /// Type of resource (e.g., "symmetric key", "pairing")
        resource_type: String,
        /// Resource identifier
        identifier: String,
    },

    /// Internal/unexpected error.
    Internal(String),
}

impl AuthKitError {
    /// Get the error code for FFI/host integration.
    pub fn code(&self) -> AuthKitErrorCode {
        match self {
            Self::MalformedInput { .. } => AuthKitErrorCode::MalformedInput,
            Self::KeyAgreement(_) => AuthKitErrorCode::KeyAgreement,
            Self::Signing(_) => AuthKitErrorCode::Signing,
            Self::Decode(_) => AuthKitErrorCode::Decode,
            Self::Transport(_) => AuthKitErrorCode::Transport,
            Self::Storage(_) => AuthKitErrorCode::Storage,
            Self::Serialization(_) => AuthKitErrorCode::Serialization,
            Self::NotFound { .. } => AuthKitErrorCode::NotFound,
            Self::Internal(_) => AuthKitErrorCode::Internal,
        }
    }

    /// Get the error message as an owned String (useful for FFI).
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Returns true if the failure comes from a collaborator that may succeed later.
    ///
    /// Nothing in this crate retries on its own; the flag is advisory for the
    /// transport owner.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Storage(_))
    }

    /// Create a malformed input error.
    pub fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(resource_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            identifier: identifier.into(),
        }
    }

    /// Create a transport error from any error type.
    pub fn transport<E: std::error::Error>(err: E) -> Self {
        Self::Transport(err.to_string())
    }
}

impl fmt::Display for AuthKitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedInput { field, reason } => write!(f, "malformed {}: {}", field, reason),
            Self::KeyAgreement(msg) => write!(f, "key agreement error: {}", msg),
            Self::Signing(msg) => write!(f, "signing error: {}", msg),
            Self::Decode(msg) => write!(f, "decode error: {}", msg),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Storage(msg) => write!(f, "storage error: {}", msg),
            Self::Serialization(msg) => write!(f, "serialization error: {}", msg),
            Self::NotFound {
                resource_type,
                identifier,
            } => write!(f, "{} not found: {}", resource_type, identifier),
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for AuthKitError {}

impl From<serde_json::Error> for AuthKitError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = AuthKitError::Transport("socket closed".into());
        assert_eq!(err.code(), AuthKitErrorCode::Transport);
        assert!(err.is_retryable());

        let err = AuthKitError::KeyAgreement("bad length".into());
        assert_eq!(err.code(), AuthKitErrorCode::KeyAgreement);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = AuthKitError::malformed("pairing uri", "missing symKey");
        assert_eq!(err.to_string(), "malformed pairing uri: missing symKey");

        let err = AuthKitError::not_found("symmetric key", "abcd");
        assert!(err.to_string().contains("symmetric key not found"));
    }

    #[test]
    fn test_from_serde_json() {
        let err: AuthKitError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.code(), AuthKitErrorCode::Serialization);
    }
}
