//! Shared doubles for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use authkit_interactive::cacao::{format_message, CacaoPayload, ED25519_SIGNATURE_TYPE};
use authkit_interactive::messages::RpcPayload;
use authkit_interactive::watch::{RESPONSE_AUTH_FIELD, WATCH_SUBSCRIPTIONS_RESPONSE_ACT};
use authkit_interactive::{
    AuthClient, AuthRequest, CacaoSignature, MessageVerifier, RequestParams, Result,
    WatchedSubscription,
};
use authkit_lib::auth_payload::{AuthAssertion, AuthPayloadBuilder, AuthSubject};
use authkit_lib::config::{AppMetadata, AuthKitConfig};
use authkit_lib::crypto::{EnvelopeType, KeyManagementService};
use authkit_lib::identity::LocalIdentitySigner;
use authkit_lib::resolver::ServiceKeys;
use authkit_lib::test_utils::{TestAccount, TEST_DOMAIN};
use authkit_lib::transport::{
    MemoryRelay, MemoryRelayClient, PublishOptions, RelayMessage, RelayTransport,
};
use authkit_lib::{unix_now, Account, Topic};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Install a test log writer; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> AuthKitConfig {
    AuthKitConfig::new(
        AppMetadata::new("Example App", "https://app.example.com")
            .with_description("integration test app"),
    )
}

pub fn request_params(nonce: &str) -> RequestParams {
    RequestParams::new(TEST_DOMAIN, "ed25519:1", nonce, "https://app.example.com/login")
        .with_statement("Sign in to Example App")
}

/// A client connected to `relay`, plus its raw relay connection.
pub fn client(relay: &Arc<MemoryRelay>) -> (Arc<AuthClient>, Arc<MemoryRelayClient>) {
    let connection = relay.connect();
    let client = AuthClient::builder(config(), connection.clone())
        .build()
        .expect("client builds");
    (client, connection)
}

/// Receive the next event, failing the test after five seconds.
pub async fn recv<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within timeout")
        .expect("event stream open")
}

/// True if no event arrives within `wait`.
pub async fn stays_quiet<T: Clone>(rx: &mut broadcast::Receiver<T>, wait: Duration) -> bool {
    tokio::time::timeout(wait, rx.recv()).await.is_err()
}

/// Signature by `wallet` over the sign-in message of `request`.
pub fn sign_request(request: &AuthRequest, wallet: &TestAccount) -> CacaoSignature {
    let payload = CacaoPayload::new(&request.payload, &wallet.account);
    let message = format_message(&payload, &wallet.account);
    CacaoSignature::new(ED25519_SIGNATURE_TYPE, wallet.sign(message.as_bytes()))
}

/// Verifier that rejects every signature.
#[derive(Default)]
pub struct RejectingVerifier {
    pub calls: AtomicUsize,
}

#[async_trait]
impl MessageVerifier for RejectingVerifier {
    async fn verify(
        &self,
        _signature: &CacaoSignature,
        _message: &str,
        _account: &Account,
    ) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }
}

/// A notify-style service answering `wc_notifyWatchSubscriptions`.
///
/// Listens on sha256(agreement key), opens `type1` requests, checks the
/// request assertion and answers `type0` on the derived response topic with
/// a `responseAuth` signed by its authentication key.
pub struct MockWatchService {
    pub domain: String,
    pub keys: ServiceKeys,
    pub request_topic: Topic,
    pub requests_seen: Arc<AtomicUsize>,
    pub rejected_assertions: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockWatchService {
    pub async fn start(
        relay: &Arc<MemoryRelay>,
        domain: &str,
        subscriptions: Vec<WatchedSubscription>,
    ) -> Self {
        let connection = relay.connect();
        let kms = Arc::new(KeyManagementService::new());
        let agreement = kms.create_key_pair().expect("service key pair");
        let request_topic = agreement.derived_topic();
        kms.set_receiving_key(request_topic.clone(), agreement)
            .expect("receiving key");

        let account = TestAccount::from_seed(200).account;
        let signer = Arc::new(LocalIdentitySigner::new());
        let authentication = signer.register_identity(&account).expect("service identity");

        let mut inbound = connection.inbound();
        connection
            .subscribe(&request_topic)
            .await
            .expect("service subscribes");

        let requests_seen = Arc::new(AtomicUsize::new(0));
        let rejected_assertions = Arc::new(AtomicUsize::new(0));
        let responder = Responder {
            connection,
            kms,
            agreement,
            account,
            builder: AuthPayloadBuilder::new(signer),
            domain: domain.to_string(),
            subscriptions,
            requests_seen: requests_seen.clone(),
            rejected_assertions: rejected_assertions.clone(),
        };
        let task = tokio::spawn(async move {
            while let Ok(message) = inbound.recv().await {
                responder.handle(message).await;
            }
        });

        Self {
            domain: domain.to_string(),
            keys: ServiceKeys {
                agreement,
                authentication,
            },
            request_topic,
            requests_seen,
            rejected_assertions,
            task,
        }
    }
}

impl Drop for MockWatchService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Responder {
    connection: Arc<MemoryRelayClient>,
    kms: Arc<KeyManagementService>,
    agreement: authkit_lib::crypto::AgreementPublicKey,
    account: Account,
    builder: AuthPayloadBuilder,
    domain: String,
    subscriptions: Vec<WatchedSubscription>,
    requests_seen: Arc<AtomicUsize>,
    rejected_assertions: Arc<AtomicUsize>,
}

impl Responder {
    async fn handle(&self, message: RelayMessage) {
        let Ok(opened) = self.kms.open(&message.topic, &message.message) else {
            return;
        };
        let Some(sender) = opened.sender_public_key else {
            return;
        };
        let Ok(RpcPayload::Request(request)) = serde_json::from_slice::<RpcPayload>(&opened.plaintext) else {
            return;
        };
        self.requests_seen.fetch_add(1, Ordering::SeqCst);

        let token = request
            .params
            .get("watchSubscriptionsAuth")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if AuthAssertion::verify(token, None, unix_now()).is_err() {
            self.rejected_assertions.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let keys = self
            .kms
            .perform_key_agreement(&self.agreement, &sender)
            .expect("agreement with requester");
        let response_topic = keys.derived_topic();
        self.kms
            .set_symmetric_key(keys.shared_key.clone(), response_topic.clone())
            .expect("response key");

        let assertion = self
            .builder
            .build(
                &AuthSubject::new(
                    self.account.clone(),
                    self.domain.clone(),
                    WATCH_SUBSCRIPTIONS_RESPONSE_ACT,
                )
                .with_claim(
                    "sbs",
                    serde_json::to_value(&self.subscriptions).expect("subscriptions encode"),
                ),
            )
            .await
            .expect("service signs");
        let body = RpcPayload::result(request.id, assertion.wrap(RESPONSE_AUTH_FIELD).to_value());
        let sealed = self
            .kms
            .seal(
                &response_topic,
                &serde_json::to_vec(&body).expect("body encodes"),
                EnvelopeType::Type0,
            )
            .expect("seal response");
        self.connection
            .publish(&response_topic, &sealed, PublishOptions::new(4011, 300))
            .await
            .expect("publish response");
    }
}
