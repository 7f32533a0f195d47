//! AuthKit Interactive Layer
//!
//! This crate implements the pairing-scoped authenticated request/response
//! protocol on top of the leaf components in `authkit-lib`:
//!
//! - [`RequestDispatcher`] subscribes to the reply topic, seals the request
//!   and publishes it
//! - [`ResponseCorrelator`] matches replies to pending requests by id and
//!   completes exactly one waiter
//! - [`AuthClient`] is the caller-facing surface for apps and wallets
//!
//! # Example
//!
//! ```rust,ignore
//! let app = AuthClient::builder(config, relay.connect()).build();
//! let uri = app.request(RequestParams::new(domain, chain_id, nonce, aud)).await?;
//! // hand `uri` to the wallet, then
//! let response = app.responses().recv().await?;
//! ```

use authkit_lib::{AuthKitError, RpcId, Topic};

pub mod auth;
pub mod cacao;
pub mod client;
pub mod correlator;
pub mod dispatcher;
pub mod events;
pub mod messages;
pub mod watch;

pub use cacao::{
    AuthPayload, AuthRequestParams, Cacao, CacaoSignature, Ed25519MessageVerifier,
    MessageVerifier, RequestParams, Requester,
};
pub use client::{AuthClient, AuthClientBuilder, SweepReport};
pub use correlator::{CorrelatedResponse, PendingCall, ResponseCorrelator, ResponseDecoder};
pub use dispatcher::{Dispatch, EnvelopeKeys, RequestDispatcher};
pub use events::{AuthRequest, AuthResponse, EventStreams};
pub use messages::{AuthErrorCode, ProtocolError, ProtocolMethod, RpcOutcome, RpcPayload};
pub use watch::{WatchSubscriptionsRequester, WatchedSubscription};

/// Result type for interactive operations.
pub type Result<T> = std::result::Result<T, InteractiveError>;

#[derive(thiserror::Error, Debug)]
pub enum InteractiveError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("no pairing matching topic {0}")]
    NoPairingMatchingTopic(Topic),
    #[error("no active account set")]
    UnknownAccount,
    #[error("key agreement error: {0}")]
    KeyAgreement(String),
    #[error("signing error: {0}")]
    Signing(String),
    #[error("protocol error {code}: {message}")]
    Protocol { code: i64, message: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("no pending request with id {0}")]
    RequestNotFound(RpcId),
    #[error("request cancelled")]
    Cancelled,
    #[error("request timed out")]
    Timeout,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl InteractiveError {
    /// Protocol error carried by this error, if any.
    pub fn protocol_error(&self) -> Option<ProtocolError> {
        match self {
            Self::Protocol { code, message } => Some(ProtocolError {
                code: *code,
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

impl From<ProtocolError> for InteractiveError {
    fn from(e: ProtocolError) -> Self {
        InteractiveError::Protocol {
            code: e.code,
            message: e.message,
        }
    }
}

impl From<serde_json::Error> for InteractiveError {
    fn from(e: serde_json::Error) -> Self {
        InteractiveError::Serialization(e.to_string())
    }
}

impl From<AuthKitError> for InteractiveError {
    fn from(e: AuthKitError) -> Self {
        match e {
            AuthKitError::MalformedInput { .. } => InteractiveError::MalformedInput(e.to_string()),
            AuthKitError::KeyAgreement(msg) => InteractiveError::KeyAgreement(msg),
            AuthKitError::Signing(msg) => InteractiveError::Signing(msg),
            AuthKitError::Decode(msg) => InteractiveError::Decode(msg),
            AuthKitError::Transport(msg) => InteractiveError::Transport(msg),
            AuthKitError::Storage(msg) => InteractiveError::Storage(msg),
            AuthKitError::Serialization(msg) => InteractiveError::Serialization(msg),
            AuthKitError::NotFound { .. } | AuthKitError::Internal(_) => {
                InteractiveError::Internal(e.to_string())
            }
        }
    }
}
