//! Caller-facing auth client.
//!
//! One [`AuthClient`] serves both roles: an app creates pairings and sends
//! auth requests, a wallet pairs from a URI and answers them. Inbound relay
//! traffic is handled by a background task that opens envelopes, records
//! incoming requests and hands responses to the correlator.
//!
//! # Timeout
//!
//! `watch_subscriptions` waits at most 30 seconds for the service.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use authkit_lib::auth_payload::AuthPayloadBuilder;
use authkit_lib::config::AuthKitConfig;
use authkit_lib::crypto::KeyManagementService;
use authkit_lib::identity::{IdentitySigner, LocalIdentitySigner};
use authkit_lib::pairing::{MemoryPairingStore, Pairing, PairingRegistry, PairingStore};
use authkit_lib::pending::{
    Direction, MemoryPendingRequestStore, PendingRequest, PendingRequestStore,
};
use authkit_lib::resolver::{DidResolver, StaticDidResolver};
use authkit_lib::transport::{RelayMessage, RelayTransport};
use authkit_lib::{unix_now, Account, PairingUri, RpcId, Topic};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::auth::{AuthRequester, AuthResponder, AuthResponseDecoder};
use crate::cacao::{
    AuthRequestParams, Cacao, CacaoSignature, Ed25519MessageVerifier, MessageVerifier,
    RequestParams,
};
use crate::correlator::{PendingCall, ResponseCorrelator};
use crate::dispatcher::{EnvelopeKeys, RequestDispatcher};
use crate::events::{AuthRequest, AuthResponse, EventStreams};
use crate::messages::{AuthErrorCode, ProtocolMethod, RpcOutcome, RpcPayload, RpcRequest};
use crate::watch::{WatchResponseDecoder, WatchSubscriptionsRequester, WatchedSubscription};
use crate::{InteractiveError, Result};

const WATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// What a sweep released.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requests: Vec<RpcId>,
    pub pairings: Vec<Topic>,
}

/// Builder for [`AuthClient`]. Unset collaborators default to in-memory ones.
pub struct AuthClientBuilder {
    config: AuthKitConfig,
    relay: Arc<dyn RelayTransport>,
    pending_store: Option<Arc<dyn PendingRequestStore>>,
    pairing_store: Option<Arc<dyn PairingStore>>,
    verifier: Option<Arc<dyn MessageVerifier>>,
    resolver: Option<Arc<dyn DidResolver>>,
    signer: Option<Arc<dyn IdentitySigner>>,
}

impl AuthClientBuilder {
    pub fn pending_store(mut self, store: Arc<dyn PendingRequestStore>) -> Self {
        self.pending_store = Some(store);
        self
    }

    pub fn pairing_store(mut self, store: Arc<dyn PairingStore>) -> Self {
        self.pairing_store = Some(store);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn MessageVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn DidResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn IdentitySigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Build the client and start its inbound loop. Requires a Tokio runtime.
    pub fn build(self) -> Result<Arc<AuthClient>> {
        let config = self.config;
        let pending = self
            .pending_store
            .unwrap_or_else(|| Arc::new(MemoryPendingRequestStore::new()));
        let pairings = PairingRegistry::new(
            self.pairing_store
                .unwrap_or_else(|| Arc::new(MemoryPairingStore::new())),
        );
        let verifier = self
            .verifier
            .unwrap_or_else(|| Arc::new(Ed25519MessageVerifier));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(StaticDidResolver::new()));
        let signer = self
            .signer
            .unwrap_or_else(|| Arc::new(LocalIdentitySigner::new()));

        let kms = Arc::new(KeyManagementService::new());
        let correlator = ResponseCorrelator::new(pending);
        correlator.register_decoder(
            ProtocolMethod::AuthRequest,
            Arc::new(AuthResponseDecoder::new(verifier)),
        )?;
        correlator.register_decoder(
            ProtocolMethod::WatchSubscriptions,
            Arc::new(WatchResponseDecoder::new(Arc::clone(&resolver))),
        )?;

        let dispatcher = Arc::new(RequestDispatcher::new(
            Arc::clone(&self.relay),
            Arc::clone(&kms),
            Arc::clone(&correlator),
            config.request_ttl_secs,
        ));
        let builder = AuthPayloadBuilder::new(signer).with_ttl_secs(config.assertion_ttl_secs);

        // Take the receiver before anything is subscribed
        let inbound = self.relay.inbound();

        let client = Arc::new(AuthClient {
            requester: AuthRequester::new(Arc::clone(&dispatcher), config.metadata.clone()),
            responder: AuthResponder::new(Arc::clone(&dispatcher)),
            watcher: WatchSubscriptionsRequester::new(
                Arc::clone(&dispatcher),
                builder,
                resolver,
                config.keyserver_url.clone(),
            ),
            events: EventStreams::new(config.event_buffer),
            config,
            kms,
            pairings,
            correlator,
            dispatcher,
            account: RwLock::new(None),
            inbound_task: Mutex::new(None),
        });

        let task = tokio::spawn(run_inbound(Arc::downgrade(&client), inbound));
        if let Ok(mut slot) = client.inbound_task.lock() {
            *slot = Some(task);
        }
        Ok(client)
    }
}

async fn run_inbound(client: Weak<AuthClient>, mut inbound: broadcast::Receiver<RelayMessage>) {
    loop {
        match inbound.recv().await {
            Ok(message) => {
                let Some(client) = client.upgrade() else {
                    break;
                };
                client.handle_message(message).await;
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "inbound relay stream lagged");
            }
            Err(RecvError::Closed) => {
                tracing::debug!("inbound relay stream closed");
                break;
            }
        }
    }
}

/// Pairing-scoped auth client for apps and wallets.
pub struct AuthClient {
    config: AuthKitConfig,
    kms: Arc<KeyManagementService>,
    pairings: PairingRegistry,
    correlator: Arc<ResponseCorrelator>,
    dispatcher: Arc<RequestDispatcher>,
    requester: AuthRequester,
    responder: AuthResponder,
    watcher: WatchSubscriptionsRequester,
    events: EventStreams,
    account: RwLock<Option<Account>>,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

impl AuthClient {
    pub fn builder(config: AuthKitConfig, relay: Arc<dyn RelayTransport>) -> AuthClientBuilder {
        AuthClientBuilder {
            config,
            relay,
            pending_store: None,
            pairing_store: None,
            verifier: None,
            resolver: None,
            signer: None,
        }
    }

    pub fn config(&self) -> &AuthKitConfig {
        &self.config
    }

    pub fn pairings(&self) -> &PairingRegistry {
        &self.pairings
    }

    pub fn kms(&self) -> &Arc<KeyManagementService> {
        &self.kms
    }

    /// Stream of auth requests received by this client.
    pub fn requests(&self) -> broadcast::Receiver<AuthRequest> {
        self.events.subscribe_requests()
    }

    /// Stream of completed auth requests sent by this client.
    pub fn responses(&self) -> broadcast::Receiver<AuthResponse> {
        self.events.subscribe_responses()
    }

    /// Set the account that answers auth requests.
    pub fn set_account(&self, account: Account) -> Result<()> {
        *self
            .account
            .write()
            .map_err(|_| InteractiveError::Internal("account lock poisoned".into()))? = Some(account);
        Ok(())
    }

    pub fn account(&self) -> Option<Account> {
        self.account.read().ok().and_then(|a| a.clone())
    }

    /// Pair with the app that produced `uri`.
    ///
    /// The URI is fully validated before any key is stored or topic subscribed.
    pub async fn pair(&self, uri: &str) -> Result<()> {
        let uri = PairingUri::parse(uri)?;
        if uri.expiry_timestamp <= unix_now() {
            return Err(InteractiveError::MalformedInput(format!(
                "pairing uri expired at {}",
                uri.expiry_timestamp
            )));
        }

        self.kms
            .set_symmetric_key(uri.sym_key.clone(), uri.topic.clone())?;
        self.pairings.register(Pairing::from_uri(&uri)).await?;
        self.dispatcher.subscribe(&uri.topic).await?;
        Ok(())
    }

    /// Create a pairing, send an auth request on it and return its URI.
    ///
    /// The outcome arrives on [`responses`](Self::responses).
    pub async fn request(&self, params: RequestParams) -> Result<PairingUri> {
        params.validate()?;
        let (topic, sym_key) = self.kms.create_symmetric_key()?;
        let uri = PairingUri {
            topic,
            relay_protocol: self.config.relay_protocol.clone(),
            sym_key,
            expiry_timestamp: unix_now() + self.config.pairing_ttl_secs,
            methods: vec![ProtocolMethod::AuthRequest.method().to_string()],
        };

        self.pairings.register(Pairing::from_uri(&uri)).await?;
        self.dispatcher.subscribe(&uri.topic).await?;
        self.requester.request(params, &uri.topic).await?;
        Ok(uri)
    }

    /// Send an auth request on an existing pairing.
    pub async fn request_on_topic(&self, params: RequestParams, topic: &Topic) -> Result<PendingCall> {
        if !self.pairings.has_pairing(topic).await? {
            return Err(InteractiveError::NoPairingMatchingTopic(topic.clone()));
        }
        self.requester.request(params, topic).await
    }

    /// Answer request `id` with a signature by the active account.
    pub async fn respond(&self, id: RpcId, signature: CacaoSignature) -> Result<Cacao> {
        let account = self.account().ok_or(InteractiveError::UnknownAccount)?;
        let (entry, request) = self.take_incoming(id).await?;

        let now = unix_now();
        if entry.is_expired(now) || request.payload_params.is_expired(now) {
            if let Err(e) = self
                .responder
                .reject(&entry, &request, AuthErrorCode::RequestExpired)
                .await
            {
                tracing::warn!(id = %id, error = %e, "failed to report expired request");
            }
            return Err(AuthErrorCode::RequestExpired.to_error().into());
        }

        match self.responder.respond(&entry, &request, &account, signature).await {
            Ok(cacao) => {
                tracing::info!(id = %id, account = %account, "auth request answered");
                self.finish_incoming(&entry.topic).await;
                Ok(cacao)
            }
            Err(e) => {
                self.restore_incoming(entry).await;
                Err(e)
            }
        }
    }

    /// Decline request `id`.
    pub async fn reject(&self, id: RpcId) -> Result<()> {
        let (entry, request) = self.take_incoming(id).await?;
        match self
            .responder
            .reject(&entry, &request, AuthErrorCode::UserRejected)
            .await
        {
            Ok(()) => {
                tracing::info!(id = %id, "auth request rejected");
                self.finish_incoming(&entry.topic).await;
                Ok(())
            }
            Err(e) => {
                self.restore_incoming(entry).await;
                Err(e)
            }
        }
    }

    /// Auth requests awaiting an answer from `account`.
    pub async fn get_pending_requests(&self, account: &Account) -> Result<Vec<AuthRequest>> {
        let entries = self.correlator.pending_store().list(account).await?;
        Ok(entries
            .into_iter()
            .filter(|e| {
                e.direction == Direction::Incoming
                    && e.method == ProtocolMethod::AuthRequest.method()
            })
            .filter_map(|e| {
                let params: AuthRequestParams = serde_json::from_value(e.params).ok()?;
                Some(AuthRequest {
                    id: e.id,
                    topic: e.topic,
                    requester: params.requester,
                    payload: params.payload_params,
                })
            })
            .collect())
    }

    /// Ask the service at `domain` for the subscriptions of `account`.
    pub async fn watch_subscriptions(
        &self,
        account: &Account,
        domain: &str,
    ) -> Result<Vec<WatchedSubscription>> {
        let call = self.watcher.watch(account, domain).await?;
        let value = call.wait_timeout(WATCH_TIMEOUT).await?.into_result()?;
        Ok(serde_json::from_value(value)?)
    }

    /// Release expired pending requests and deactivate expired pairings.
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        let now = unix_now();
        let pending = self.correlator.pending_store();

        let mut requests = self.correlator.sweep_expired(now).await?;
        for entry in pending.list_all().await? {
            if entry.direction == Direction::Incoming
                && entry.is_expired(now)
                && pending.remove(entry.id).await?.is_some()
            {
                requests.push(entry.id);
            }
        }

        let pairings = self.pairings.sweep_expired(now).await?;
        for topic in &pairings {
            self.dispatcher.unsubscribe(topic).await?;
        }
        Ok(SweepReport { requests, pairings })
    }

    /// Stop the inbound loop and unsubscribe from every topic.
    pub async fn shutdown(&self) {
        let task = match self.inbound_task.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(task) = task {
            task.abort();
        }
        self.dispatcher.unsubscribe_all().await;
        tracing::info!("auth client shut down");
    }

    async fn take_incoming(&self, id: RpcId) -> Result<(PendingRequest, AuthRequestParams)> {
        let pending = self.correlator.pending_store();
        match pending.get(id).await? {
            Some(entry)
                if entry.direction == Direction::Incoming
                    && entry.method == ProtocolMethod::AuthRequest.method() => {}
            _ => return Err(InteractiveError::RequestNotFound(id)),
        }
        let entry = pending
            .remove(id)
            .await?
            .ok_or(InteractiveError::RequestNotFound(id))?;
        match serde_json::from_value(entry.params.clone()) {
            Ok(request) => Ok((entry, request)),
            Err(e) => Err(InteractiveError::Decode(format!("stored request {}: {}", id, e))),
        }
    }

    async fn restore_incoming(&self, entry: PendingRequest) {
        let id = entry.id;
        if let Err(e) = self.correlator.pending_store().put(entry).await {
            tracing::warn!(id = %id, error = %e, "failed to restore pending request");
        }
    }

    async fn finish_incoming(&self, pairing_topic: &Topic) {
        if let Err(e) = self.pairings.deactivate(pairing_topic).await {
            tracing::debug!(topic = %pairing_topic, error = %e, "no pairing to deactivate");
        }
    }

    async fn handle_message(&self, message: RelayMessage) {
        let opened = match self.kms.open(&message.topic, &message.message) {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "dropping message that cannot be opened");
                return;
            }
        };
        let payload: RpcPayload = match serde_json::from_slice(&opened.plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "dropping malformed payload");
                return;
            }
        };

        let id = payload.id();
        let handled = match payload {
            RpcPayload::Request(request) => self.handle_request(&message.topic, request).await,
            RpcPayload::Result(result) => {
                self.handle_response(&message.topic, result.id, RpcOutcome::Success(result.result))
                    .await
            }
            RpcPayload::Error(error) => {
                self.handle_response(&message.topic, error.id, RpcOutcome::Failure(error.error))
                    .await
            }
        };
        if let Err(e) = handled {
            tracing::error!(id = %id, topic = %message.topic, error = %e, "inbound message handling failed");
        }
    }

    async fn handle_request(&self, topic: &Topic, request: RpcRequest) -> Result<()> {
        if ProtocolMethod::from_method(&request.method) != Some(ProtocolMethod::AuthRequest) {
            tracing::warn!(id = %request.id, method = %request.method, "ignoring unsupported request");
            return Ok(());
        }

        let params: AuthRequestParams = match serde_json::from_value(request.params.clone()) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!(id = %request.id, topic = %topic, error = %e, "malformed auth request");
                return self
                    .dispatcher
                    .respond(
                        topic,
                        request.id,
                        ProtocolMethod::AuthRequest,
                        RpcOutcome::Failure(AuthErrorCode::MalformedRequestParams.to_error()),
                        &EnvelopeKeys::Type0,
                    )
                    .await;
            }
        };

        let entry = PendingRequest::new(
            request.id,
            topic.clone(),
            ProtocolMethod::AuthRequest.method(),
            Direction::Incoming,
            request.params,
            self.config.request_ttl_secs,
        );
        if !self.correlator.pending_store().put(entry).await? {
            tracing::debug!(id = %request.id, "duplicate auth request delivery");
            return Ok(());
        }

        if let Err(e) = self
            .pairings
            .update_peer(
                topic,
                Some(params.requester.metadata.clone()),
                unix_now() + self.config.active_pairing_ttl_secs,
            )
            .await
        {
            tracing::debug!(topic = %topic, error = %e, "request on unknown pairing");
        }

        self.events.publish_request(AuthRequest {
            id: request.id,
            topic: topic.clone(),
            requester: params.requester,
            payload: params.payload_params,
        });
        Ok(())
    }

    async fn handle_response(&self, topic: &Topic, id: RpcId, outcome: RpcOutcome) -> Result<()> {
        let Some(response) = self.correlator.correlate(topic, id, outcome).await? else {
            return Ok(());
        };
        if response.method() != Some(ProtocolMethod::AuthRequest) {
            return Ok(());
        }

        let result = response.result.and_then(|value| {
            serde_json::from_value::<Cacao>(value)
                .map_err(|_| AuthErrorCode::MalformedResponseParams.to_error())
        });
        self.events.publish_response(AuthResponse { id, result });

        self.dispatcher.unsubscribe(topic).await?;
        if let Err(e) = self.pairings.deactivate(&response.request.topic).await {
            tracing::debug!(topic = %response.request.topic, error = %e, "no pairing to deactivate");
        }
        Ok(())
    }
}

impl Drop for AuthClient {
    fn drop(&mut self) {
        if let Some(task) = self.inbound_task.get_mut().ok().and_then(|t| t.take()) {
            task.abort();
        }
    }
}
