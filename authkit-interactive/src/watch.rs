//! `wc_notifyWatchSubscriptions` flow.
//!
//! First contact with a service uses its published agreement key `S`:
//!
//! ```text
//! request topic  = sha256(S)
//! shared         = HKDF(X25519(self, S))
//! response topic = sha256(shared)
//! ```
//!
//! The request carries a signed watch assertion and is sealed `type1`; the
//! service answers `type0` on the response topic with a `responseAuth` JWT
//! signed by its authentication key.

use std::sync::Arc;

use async_trait::async_trait;
use authkit_lib::auth_payload::{AssertionClaims, AuthAssertion, AuthPayloadBuilder, AuthPayloadWrapper, AuthSubject};
use authkit_lib::crypto::KeyAgreementService;
use authkit_lib::pending::PendingRequest;
use authkit_lib::resolver::DidResolver;
use authkit_lib::{jwt, unix_now, Account};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlator::{PendingCall, ResponseDecoder};
use crate::dispatcher::{Dispatch, EnvelopeKeys, RequestDispatcher};
use crate::messages::{AuthErrorCode, ProtocolError, ProtocolMethod, RpcOutcome};
use crate::Result;

/// `act` claim of watch requests.
pub const WATCH_SUBSCRIPTIONS_ACT: &str = "notify_watch_subscriptions";
/// `act` claim of the service's answer.
pub const WATCH_SUBSCRIPTIONS_RESPONSE_ACT: &str = "notify_watch_subscriptions_response";
/// Params field carrying the request assertion.
pub const WATCH_AUTH_FIELD: &str = "watchSubscriptionsAuth";
/// Result field carrying the service's assertion.
pub const RESPONSE_AUTH_FIELD: &str = "responseAuth";

/// A subscription reported by the service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedSubscription {
    pub app_domain: String,
    /// `did:pkh` of the subscribed account.
    pub account: String,
    #[serde(default)]
    pub scope: Vec<String>,
    pub expiry: i64,
}

impl WatchedSubscription {
    pub fn account(&self) -> Result<Account> {
        Ok(Account::from_did_pkh(&self.account)?)
    }
}

/// Sends watch requests to a service.
pub struct WatchSubscriptionsRequester {
    dispatcher: Arc<RequestDispatcher>,
    agreement: KeyAgreementService,
    builder: AuthPayloadBuilder,
    resolver: Arc<dyn DidResolver>,
    keyserver_url: String,
}

impl WatchSubscriptionsRequester {
    pub fn new(
        dispatcher: Arc<RequestDispatcher>,
        builder: AuthPayloadBuilder,
        resolver: Arc<dyn DidResolver>,
        keyserver_url: impl Into<String>,
    ) -> Self {
        let agreement = KeyAgreementService::new(Arc::clone(dispatcher.kms()));
        Self {
            dispatcher,
            agreement,
            builder,
            resolver,
            keyserver_url: keyserver_url.into(),
        }
    }

    /// Ask the service at `domain` for the subscriptions of `account`.
    pub async fn watch(&self, account: &Account, domain: &str) -> Result<PendingCall> {
        let service_key = self.resolver.resolve_agreement_key(domain).await?;
        let request_topic = KeyAgreementService::derive_response_topic(service_key.as_bytes());
        let session = self
            .agreement
            .generate_agreement_keys_if_needed(service_key.as_bytes(), account)?;

        let assertion = self
            .builder
            .build(
                &AuthSubject::new(account.clone(), domain, WATCH_SUBSCRIPTIONS_ACT)
                    .with_claim("ksu", self.keyserver_url.clone()),
            )
            .await?;
        let keys = self
            .dispatcher
            .kms()
            .perform_key_agreement(&session.self_public_key, &service_key)?;

        let call = self
            .dispatcher
            .dispatch(Dispatch {
                method: ProtocolMethod::WatchSubscriptions,
                params: assertion.wrap(WATCH_AUTH_FIELD).to_value(),
                topic: request_topic.clone(),
                response_topic: session.response_topic,
                envelope: EnvelopeKeys::Type1(keys),
                account: Some(account.clone()),
            })
            .await?;
        tracing::info!(id = %call.id(), account = %account, topic = %request_topic, "watch subscriptions sent");
        Ok(call)
    }
}

/// Verifies the service's `responseAuth` and extracts its subscriptions.
pub struct WatchResponseDecoder {
    resolver: Arc<dyn DidResolver>,
}

impl WatchResponseDecoder {
    pub fn new(resolver: Arc<dyn DidResolver>) -> Self {
        Self { resolver }
    }

    /// Service domain named by the audience of our own request assertion.
    fn requested_domain(request: &PendingRequest) -> Option<String> {
        let wrapper = AuthPayloadWrapper::from_value(&request.params, WATCH_AUTH_FIELD).ok()?;
        let claims = jwt::decode::<AssertionClaims>(&wrapper.jwt).ok()?.claims;
        claims.aud.strip_prefix("did:web:").map(str::to_string)
    }
}

#[async_trait]
impl ResponseDecoder for WatchResponseDecoder {
    async fn decode(
        &self,
        request: &PendingRequest,
        outcome: RpcOutcome,
    ) -> std::result::Result<Value, ProtocolError> {
        let value = match outcome {
            RpcOutcome::Success(value) => value,
            RpcOutcome::Failure(error) => return Err(error),
        };
        let malformed = || AuthErrorCode::MalformedResponseParams.to_error();

        let domain = Self::requested_domain(request)
            .ok_or_else(|| AuthErrorCode::MalformedRequestParams.to_error())?;
        let response = AuthPayloadWrapper::from_value(&value, RESPONSE_AUTH_FIELD).map_err(|_| malformed())?;

        let service_key = self
            .resolver
            .resolve_authentication_key(&domain)
            .await
            .map_err(|e| {
                tracing::warn!(domain = %domain, error = %e, "cannot resolve service key");
                AuthErrorCode::SignatureVerificationFailed.to_error()
            })?;
        let assertion = AuthAssertion::verify(&response.jwt, Some(&service_key), unix_now()).map_err(|e| {
            tracing::warn!(id = %request.id, error = %e, "responseAuth rejected");
            AuthErrorCode::SignatureVerificationFailed.to_error()
        })?;
        if assertion.claims().act != WATCH_SUBSCRIPTIONS_RESPONSE_ACT {
            return Err(malformed());
        }

        let subscriptions: Vec<WatchedSubscription> = assertion
            .claims()
            .claim("sbs")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|_| malformed())?
            .unwrap_or_default();
        serde_json::to_value(subscriptions).map_err(|_| malformed())
    }
}
