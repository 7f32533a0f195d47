//! `wc_authRequest` flow.
//!
//! The app publishes the request `type0` on the pairing topic and listens on
//! `sha256(P_app)`, where `P_app` is a fresh agreement key carried in the
//! requester block. The wallet answers `type1` on that topic: it creates its
//! own key pair, agrees with `P_app` and embeds its public key in the
//! envelope, so only the app can open the answer.

use std::sync::Arc;

use async_trait::async_trait;
use authkit_lib::config::AppMetadata;
use authkit_lib::pending::PendingRequest;
use authkit_lib::{Account, Topic};
use serde_json::Value;

use crate::cacao::{
    format_message, AuthPayload, AuthRequestParams, Cacao, CacaoPayload, CacaoSignature,
    MessageVerifier, RequestParams, Requester,
};
use crate::correlator::{PendingCall, ResponseDecoder};
use crate::dispatcher::{Dispatch, EnvelopeKeys, RequestDispatcher};
use crate::messages::{AuthErrorCode, ProtocolError, ProtocolMethod, RpcOutcome};
use crate::Result;

/// App side: sends auth requests over a pairing.
pub struct AuthRequester {
    dispatcher: Arc<RequestDispatcher>,
    metadata: AppMetadata,
}

impl AuthRequester {
    pub fn new(dispatcher: Arc<RequestDispatcher>, metadata: AppMetadata) -> Self {
        Self {
            dispatcher,
            metadata,
        }
    }

    /// Send an auth request on `pairing_topic`.
    ///
    /// The pairing's symmetric key must already be in the keychain.
    pub async fn request(&self, params: RequestParams, pairing_topic: &Topic) -> Result<PendingCall> {
        params.validate()?;
        let kms = self.dispatcher.kms();

        let public_key = kms.create_key_pair()?;
        let response_topic = public_key.derived_topic();
        kms.set_receiving_key(response_topic.clone(), public_key)?;

        let request = AuthRequestParams {
            requester: Requester {
                public_key,
                metadata: self.metadata.clone(),
            },
            payload_params: AuthPayload::new(params),
        };
        let dispatch = Dispatch {
            method: ProtocolMethod::AuthRequest,
            params: serde_json::to_value(&request)?,
            topic: pairing_topic.clone(),
            response_topic,
            envelope: EnvelopeKeys::Type0,
            account: None,
        };

        match self.dispatcher.dispatch(dispatch).await {
            Ok(call) => {
                tracing::info!(id = %call.id(), topic = %pairing_topic, "auth request sent");
                Ok(call)
            }
            Err(e) => {
                kms.delete_private_key(&public_key)?;
                Err(e)
            }
        }
    }
}

/// App side: checks a wallet's CACAO against the request it answers.
pub struct AuthResponseDecoder {
    verifier: Arc<dyn MessageVerifier>,
}

impl AuthResponseDecoder {
    pub fn new(verifier: Arc<dyn MessageVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl ResponseDecoder for AuthResponseDecoder {
    async fn decode(
        &self,
        request: &PendingRequest,
        outcome: RpcOutcome,
    ) -> std::result::Result<Value, ProtocolError> {
        let value = match outcome {
            RpcOutcome::Success(value) => value,
            RpcOutcome::Failure(error) => return Err(error),
        };

        let requested: AuthRequestParams = serde_json::from_value(request.params.clone())
            .map_err(|_| AuthErrorCode::MalformedRequestParams.to_error())?;
        let cacao: Cacao = serde_json::from_value(value.clone()).map_err(|e| {
            tracing::warn!(id = %request.id, error = %e, "malformed CACAO");
            AuthErrorCode::MalformedResponseParams.to_error()
        })?;

        if !cacao.p.matches(&requested.payload_params) {
            tracing::warn!(id = %request.id, "CACAO does not match the requested payload");
            return Err(AuthErrorCode::MessageCompromised.to_error());
        }
        let account = cacao
            .p
            .account()
            .map_err(|_| AuthErrorCode::MalformedResponseParams.to_error())?;

        let message = format_message(&cacao.p, &account);
        match self.verifier.verify(&cacao.s, &message, &account).await {
            Ok(true) => Ok(value),
            Ok(false) => Err(AuthErrorCode::SignatureVerificationFailed.to_error()),
            Err(e) => {
                tracing::warn!(id = %request.id, error = %e, "signature verification errored");
                Err(AuthErrorCode::SignatureVerificationFailed.to_error())
            }
        }
    }
}

/// Wallet side: answers received auth requests.
pub struct AuthResponder {
    dispatcher: Arc<RequestDispatcher>,
}

impl AuthResponder {
    pub fn new(dispatcher: Arc<RequestDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Answer `entry` with a CACAO signed by `account`.
    pub async fn respond(
        &self,
        entry: &PendingRequest,
        request: &AuthRequestParams,
        account: &Account,
        signature: CacaoSignature,
    ) -> Result<Cacao> {
        let cacao = Cacao::new(CacaoPayload::new(&request.payload_params, account), signature);
        self.answer(entry, request, RpcOutcome::Success(serde_json::to_value(&cacao)?))
            .await?;
        Ok(cacao)
    }

    /// Answer `entry` with a protocol error.
    pub async fn reject(
        &self,
        entry: &PendingRequest,
        request: &AuthRequestParams,
        code: AuthErrorCode,
    ) -> Result<()> {
        self.answer(entry, request, RpcOutcome::Failure(code.to_error()))
            .await
    }

    async fn answer(
        &self,
        entry: &PendingRequest,
        request: &AuthRequestParams,
        outcome: RpcOutcome,
    ) -> Result<()> {
        let kms = self.dispatcher.kms();
        let peer = request.requester.public_key;
        let self_public_key = kms.create_key_pair()?;

        let sent = match kms.perform_key_agreement(&self_public_key, &peer) {
            Ok(keys) => {
                self.dispatcher
                    .respond(
                        &peer.derived_topic(),
                        entry.id,
                        ProtocolMethod::AuthRequest,
                        outcome,
                        &EnvelopeKeys::Type1(keys),
                    )
                    .await
            }
            Err(e) => Err(e.into()),
        };
        // The wallet key is single-use
        kms.delete_private_key(&self_public_key)?;
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cacao::ED25519_SIGNATURE_TYPE;
    use crate::Ed25519MessageVerifier;
    use authkit_lib::crypto::KeyManagementService;
    use authkit_lib::pending::Direction;
    use authkit_lib::test_utils::{test_topic, TestAccount, TEST_DOMAIN};
    use authkit_lib::RpcId;

    fn pending_request() -> (PendingRequest, AuthRequestParams) {
        let kms = KeyManagementService::new();
        let request = AuthRequestParams {
            requester: Requester {
                public_key: kms.create_key_pair().unwrap(),
                metadata: AppMetadata::new("App", "https://app.example.com"),
            },
            payload_params: AuthPayload::new(RequestParams::new(
                TEST_DOMAIN,
                "ed25519:1",
                "nonce-1",
                "https://app.example.com/login",
            )),
        };
        let entry = PendingRequest::new(
            RpcId(1),
            test_topic(1),
            ProtocolMethod::AuthRequest.method(),
            Direction::Outgoing,
            serde_json::to_value(&request).unwrap(),
            60,
        );
        (entry, request)
    }

    fn signed_cacao(request: &AuthRequestParams, wallet: &TestAccount) -> Cacao {
        let payload = CacaoPayload::new(&request.payload_params, &wallet.account);
        let message = format_message(&payload, &wallet.account);
        Cacao::new(
            payload,
            CacaoSignature::new(ED25519_SIGNATURE_TYPE, wallet.sign(message.as_bytes())),
        )
    }

    fn decoder() -> AuthResponseDecoder {
        AuthResponseDecoder::new(Arc::new(Ed25519MessageVerifier))
    }

    #[tokio::test]
    async fn test_valid_cacao_is_accepted() {
        let (entry, request) = pending_request();
        let cacao = signed_cacao(&request, &TestAccount::from_seed(1));

        let value = decoder()
            .decode(&entry, RpcOutcome::Success(serde_json::to_value(&cacao).unwrap()))
            .await
            .unwrap();
        assert_eq!(serde_json::from_value::<Cacao>(value).unwrap(), cacao);
    }

    #[tokio::test]
    async fn test_tampered_payload_is_compromised() {
        let (entry, request) = pending_request();
        let mut cacao = signed_cacao(&request, &TestAccount::from_seed(1));
        cacao.p.nonce = "other".into();

        let err = decoder()
            .decode(&entry, RpcOutcome::Success(serde_json::to_value(&cacao).unwrap()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(AuthErrorCode::MessageCompromised));
    }

    #[tokio::test]
    async fn test_wrong_signer_fails_verification() {
        let (entry, request) = pending_request();
        let mut cacao = signed_cacao(&request, &TestAccount::from_seed(1));
        cacao.s = signed_cacao(&request, &TestAccount::from_seed(2)).s;

        let err = decoder()
            .decode(&entry, RpcOutcome::Success(serde_json::to_value(&cacao).unwrap()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(AuthErrorCode::SignatureVerificationFailed));
    }

    #[tokio::test]
    async fn test_malformed_and_failure_outcomes() {
        let (entry, _) = pending_request();

        let err = decoder()
            .decode(&entry, RpcOutcome::Success(serde_json::json!({ "h": 1 })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(AuthErrorCode::MalformedResponseParams));

        let err = decoder()
            .decode(&entry, RpcOutcome::Failure(AuthErrorCode::UserRejected.to_error()))
            .await
            .unwrap_err();
        assert_eq!(err.code, 14001);
    }
}
