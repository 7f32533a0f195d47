//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use authkit_lib::prelude::*;
//! ```
//!
//! ## What's Included
//!
//! - Core types: `Topic`, `Account`, `RpcId`
//! - Error types: `AuthKitError`, `AuthKitErrorCode`, `Result`
//! - Key material: `KeyManagementService`, `KeyAgreementService`, `EnvelopeType`
//! - Identity: `IdentitySigner`, `LocalIdentitySigner`, `AuthPayloadBuilder`
//! - Storage: `PairingRegistry`, `PendingRequestStore`
//! - Relay: `RelayTransport`, `MemoryRelay`

// Core types
pub use crate::{Account, RpcId, Topic};

// Error handling
pub use crate::errors::{AuthKitError, AuthKitErrorCode};
pub use crate::Result;

// Configuration
pub use crate::config::{AppMetadata, AuthKitConfig};

// Key material
pub use crate::crypto::{
    derive_topic, AgreementPublicKey, EnvelopeType, KeyAgreementService, KeyManagementService,
    SymmetricKey,
};

// Identity and assertions
pub use crate::auth_payload::{AuthAssertion, AuthPayloadBuilder, AuthSubject};
pub use crate::identity::{DidKey, IdentitySigner, LocalIdentitySigner};
pub use crate::resolver::{DidResolver, StaticDidResolver};

// Pairings and pending requests
pub use crate::pairing::{Pairing, PairingRegistry};
pub use crate::pending::{
    Direction, FilePendingRequestStore, MemoryPendingRequestStore, PendingRequest,
    PendingRequestStore,
};
pub use crate::uri::PairingUri;

// Relay
pub use crate::transport::{MemoryRelay, PublishOptions, RelayTransport};
