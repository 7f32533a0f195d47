//! Outbound request dispatch.
//!
//! Every dispatch follows the same order:
//!
//! 1. record the pending entry and register the waiter
//! 2. subscribe to the response topic
//! 3. seal the request and publish it
//!
//! A reply can therefore never arrive on a topic nobody listens to, and a
//! reply that arrives before the caller starts waiting is buffered in the
//! waiter. A failed step releases what earlier steps created.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use authkit_lib::crypto::{AgreementKeys, EnvelopeType, KeyManagementService};
use authkit_lib::pending::{Direction, PendingRequest};
use authkit_lib::transport::{PublishOptions, RelayTransport};
use authkit_lib::{Account, RpcId, Topic};
use serde_json::Value;

use crate::correlator::{PendingCall, ResponseCorrelator};
use crate::messages::{ProtocolMethod, RpcOutcome, RpcPayload, RpcRequest};
use crate::{InteractiveError, Result};

/// How a message is sealed.
#[derive(Clone, Debug)]
pub enum EnvelopeKeys {
    /// Symmetric key registered for the destination topic.
    Type0,
    /// Agreement with the recipient; the sender public key travels in the envelope.
    Type1(AgreementKeys),
}

/// A request ready to go out.
#[derive(Clone, Debug)]
pub struct Dispatch {
    pub method: ProtocolMethod,
    pub params: Value,
    /// Topic the request is published on.
    pub topic: Topic,
    /// Topic the counterparty replies on.
    pub response_topic: Topic,
    pub envelope: EnvelopeKeys,
    pub account: Option<Account>,
}

/// Sends requests and responses over the relay.
pub struct RequestDispatcher {
    relay: Arc<dyn RelayTransport>,
    kms: Arc<KeyManagementService>,
    correlator: Arc<ResponseCorrelator>,
    subscriptions: Mutex<HashSet<Topic>>,
    request_ttl_secs: i64,
}

impl RequestDispatcher {
    pub fn new(
        relay: Arc<dyn RelayTransport>,
        kms: Arc<KeyManagementService>,
        correlator: Arc<ResponseCorrelator>,
        request_ttl_secs: i64,
    ) -> Self {
        Self {
            relay,
            kms,
            correlator,
            subscriptions: Mutex::new(HashSet::new()),
            request_ttl_secs,
        }
    }

    pub fn kms(&self) -> &Arc<KeyManagementService> {
        &self.kms
    }

    pub fn correlator(&self) -> &Arc<ResponseCorrelator> {
        &self.correlator
    }

    /// Dispatch a request and return the handle its response completes.
    pub async fn dispatch(&self, dispatch: Dispatch) -> Result<PendingCall> {
        let ttl_secs = dispatch.method.ttl_secs().min(self.request_ttl_secs);
        let pending = self.correlator.pending_store();

        // Ids are process-unique; a collision with a reloaded entry is retried
        let id = loop {
            let id = RpcId::generate();
            let mut entry = PendingRequest::new(
                id,
                dispatch.topic.clone(),
                dispatch.method.method(),
                Direction::Outgoing,
                dispatch.params.clone(),
                ttl_secs,
            );
            if let Some(account) = &dispatch.account {
                entry = entry.with_account(account.clone());
            }
            if pending.put(entry).await? {
                break id;
            }
        };
        let call = self.correlator.register(id)?;

        if let Err(e) = self.send_request(id, &dispatch).await {
            tracing::warn!(id = %id, topic = %dispatch.topic, error = %e, "dispatch failed");
            self.correlator.release(id).await?;
            return Err(e);
        }
        Ok(call)
    }

    async fn send_request(&self, id: RpcId, dispatch: &Dispatch) -> Result<()> {
        self.subscribe(&dispatch.response_topic).await?;

        let body = RpcPayload::Request(RpcRequest::new(id, dispatch.method, dispatch.params.clone()));
        let message = self.seal(&dispatch.topic, &body, &dispatch.envelope)?;

        let mut options =
            PublishOptions::new(dispatch.method.request_tag(), dispatch.method.ttl_secs());
        if dispatch.method.prompt() {
            options = options.with_prompt();
        }
        self.relay.publish(&dispatch.topic, &message, options).await?;
        tracing::debug!(
            id = %id,
            method = %dispatch.method,
            topic = %dispatch.topic,
            response_topic = %dispatch.response_topic,
            "request dispatched"
        );
        Ok(())
    }

    /// Publish the response to request `id` on `topic`.
    pub async fn respond(
        &self,
        topic: &Topic,
        id: RpcId,
        method: ProtocolMethod,
        outcome: RpcOutcome,
        envelope: &EnvelopeKeys,
    ) -> Result<()> {
        let body = match outcome {
            RpcOutcome::Success(value) => RpcPayload::result(id, value),
            RpcOutcome::Failure(error) => RpcPayload::error(id, error),
        };
        let message = self.seal(topic, &body, envelope)?;
        self.relay
            .publish(
                topic,
                &message,
                PublishOptions::new(method.response_tag(), method.ttl_secs()),
            )
            .await?;
        tracing::debug!(id = %id, method = %method, topic = %topic, "response published");
        Ok(())
    }

    fn seal(&self, topic: &Topic, body: &RpcPayload, envelope: &EnvelopeKeys) -> Result<String> {
        let plaintext = serde_json::to_vec(body)?;
        let sealed = match envelope {
            EnvelopeKeys::Type0 => self.kms.seal(topic, &plaintext, EnvelopeType::Type0)?,
            EnvelopeKeys::Type1(keys) => self.kms.seal_with_agreement(&plaintext, keys)?,
        };
        Ok(sealed)
    }

    /// Subscribe to `topic`. Always reaches the relay; subscribing is idempotent there.
    pub async fn subscribe(&self, topic: &Topic) -> Result<()> {
        self.relay.subscribe(topic).await?;
        let newly = self
            .subscriptions
            .lock()
            .map_err(|_| InteractiveError::Internal("subscription set lock poisoned".into()))?
            .insert(topic.clone());
        if newly {
            tracing::debug!(topic = %topic, "subscribed");
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        let tracked = self
            .subscriptions
            .lock()
            .map_err(|_| InteractiveError::Internal("subscription set lock poisoned".into()))?
            .remove(topic);
        if tracked {
            self.relay.unsubscribe(topic).await?;
            tracing::debug!(topic = %topic, "unsubscribed");
        }
        Ok(())
    }

    /// Topics currently subscribed through this dispatcher.
    pub fn subscriptions(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .subscriptions
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Unsubscribe from every tracked topic. Failures are logged and skipped.
    pub async fn unsubscribe_all(&self) {
        let topics: Vec<Topic> = match self.subscriptions.lock() {
            Ok(mut set) => set.drain().collect(),
            Err(_) => return,
        };
        for topic in topics {
            if let Err(e) = self.relay.unsubscribe(&topic).await {
                tracing::warn!(topic = %topic, error = %e, "unsubscribe failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authkit_lib::pending::{MemoryPendingRequestStore, PendingRequestStore};
    use authkit_lib::transport::{MemoryRelay, RelayCall};
    use serde_json::json;

    struct Harness {
        client: Arc<authkit_lib::transport::MemoryRelayClient>,
        dispatcher: RequestDispatcher,
        pending: Arc<MemoryPendingRequestStore>,
        topic: Topic,
    }

    fn harness() -> Harness {
        let relay = MemoryRelay::new();
        let client = relay.connect();
        let kms = Arc::new(KeyManagementService::new());
        let (topic, _) = kms.create_symmetric_key().unwrap();
        let pending = Arc::new(MemoryPendingRequestStore::new());
        let correlator = ResponseCorrelator::new(pending.clone());
        let dispatcher = RequestDispatcher::new(client.clone(), kms, correlator, 86_400);
        Harness {
            client,
            dispatcher,
            pending,
            topic,
        }
    }

    fn dispatch(topic: &Topic) -> Dispatch {
        Dispatch {
            method: ProtocolMethod::AuthRequest,
            params: json!({ "k": "v" }),
            topic: topic.clone(),
            response_topic: authkit_lib::test_utils::test_topic(77),
            envelope: EnvelopeKeys::Type0,
            account: None,
        }
    }

    #[tokio::test]
    async fn test_subscribe_precedes_publish() {
        let h = harness();
        let call = h.dispatcher.dispatch(dispatch(&h.topic)).await.unwrap();

        let calls = h.client.calls();
        assert_eq!(
            calls,
            vec![
                RelayCall::Subscribe(authkit_lib::test_utils::test_topic(77)),
                RelayCall::Publish {
                    topic: h.topic.clone(),
                    tag: 3000
                },
            ]
        );
        let entry = h.pending.get(call.id()).await.unwrap().unwrap();
        assert_eq!(entry.direction, Direction::Outgoing);
        assert_eq!(entry.method, "wc_authRequest");
    }

    #[tokio::test]
    async fn test_publish_failure_releases_entry() {
        let h = harness();
        h.client.set_fail_publish(true);

        let err = h.dispatcher.dispatch(dispatch(&h.topic)).await.unwrap_err();
        assert!(matches!(err, InteractiveError::Transport(_)));
        assert!(h.pending.list_all().await.unwrap().is_empty());
        assert_eq!(h.dispatcher.correlator().waiting(), 0);
    }

    #[tokio::test]
    async fn test_missing_topic_key_fails_before_publish() {
        let h = harness();
        let unknown = authkit_lib::test_utils::test_topic(5);

        assert!(h.dispatcher.dispatch(dispatch(&unknown)).await.is_err());
        assert!(!h
            .client
            .calls()
            .iter()
            .any(|c| matches!(c, RelayCall::Publish { .. })));
        assert!(h.pending.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let h = harness();
        h.dispatcher.subscribe(&h.topic).await.unwrap();
        h.dispatcher.dispatch(dispatch(&h.topic)).await.unwrap();
        assert_eq!(h.dispatcher.subscriptions().len(), 2);

        h.dispatcher.unsubscribe_all().await;
        assert!(h.dispatcher.subscriptions().is_empty());
        let unsubscribes = h
            .client
            .calls()
            .into_iter()
            .filter(|c| matches!(c, RelayCall::Unsubscribe(_)))
            .count();
        assert_eq!(unsubscribes, 2);
    }
}
