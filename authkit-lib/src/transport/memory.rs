//! In-process relay.
//!
//! [`MemoryRelay`] is a hub shared by any number of [`MemoryRelayClient`]s.
//! It mirrors the relay behaviour the protocol relies on:
//!
//! - messages fan out to every client subscribed to the topic, except the publisher
//! - messages are kept until their TTL so late subscribers still receive them
//!
//! Each client records the calls made on it, so tests can assert ordering
//! (e.g. that a response topic was subscribed before the request went out).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{PublishOptions, RelayMessage, RelayTransport};
use crate::{unix_now, AuthKitError, Result, Topic};

/// Capacity of each client's inbound channel.
const INBOUND_CAPACITY: usize = 1024;

/// A call made on a relay client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayCall {
    Subscribe(Topic),
    Unsubscribe(Topic),
    Publish { topic: Topic, tag: u32 },
}

struct StoredMessage {
    message: RelayMessage,
    publisher: u64,
    expires_at: i64,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<u64, broadcast::Sender<RelayMessage>>,
    subscriptions: HashMap<Topic, HashSet<u64>>,
    mailbox: HashMap<Topic, Vec<StoredMessage>>,
}

/// Shared in-process relay hub.
#[derive(Default)]
pub struct MemoryRelay {
    state: Mutex<HubState>,
    next_client: AtomicU64,
}

fn lock_error() -> AuthKitError {
    AuthKitError::Transport("memory relay lock poisoned".into())
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect a new client to the hub.
    pub fn connect(self: &Arc<Self>) -> Arc<MemoryRelayClient> {
        let id = self.next_client.fetch_add(1, Ordering::SeqCst);
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        if let Ok(mut state) = self.state.lock() {
            state.clients.insert(id, inbound.clone());
        }
        Arc::new(MemoryRelayClient {
            id,
            relay: Arc::clone(self),
            inbound,
            calls: Mutex::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
        })
    }

    /// Number of stored (not yet expired) messages on `topic`.
    pub fn stored_messages(&self, topic: &Topic) -> usize {
        let now = unix_now();
        self.state
            .lock()
            .map(|state| {
                state
                    .mailbox
                    .get(topic)
                    .map_or(0, |m| m.iter().filter(|s| s.expires_at > now).count())
            })
            .unwrap_or(0)
    }

    fn subscribe(&self, client: u64, topic: &Topic) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| lock_error())?;
        let newly = state
            .subscriptions
            .entry(topic.clone())
            .or_default()
            .insert(client);
        if !newly {
            return Ok(());
        }

        let now = unix_now();
        let backlog: Vec<RelayMessage> = state
            .mailbox
            .get(topic)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|s| s.publisher != client && s.expires_at > now)
                    .map(|s| s.message.clone())
                    .collect()
            })
            .unwrap_or_default();
        if let Some(sender) = state.clients.get(&client) {
            for message in backlog {
                let _ = sender.send(message);
            }
        }
        Ok(())
    }

    fn unsubscribe(&self, client: u64, topic: &Topic) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| lock_error())?;
        if let Some(subscribers) = state.subscriptions.get_mut(topic) {
            subscribers.remove(&client);
        }
        Ok(())
    }

    fn publish(&self, client: u64, message: RelayMessage, ttl_secs: i64) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| lock_error())?;
        let now = unix_now();

        let stored = state.mailbox.entry(message.topic.clone()).or_default();
        stored.retain(|s| s.expires_at > now);
        stored.push(StoredMessage {
            message: message.clone(),
            publisher: client,
            expires_at: now + ttl_secs,
        });

        let recipients: Vec<u64> = state
            .subscriptions
            .get(&message.topic)
            .map(|s| s.iter().copied().filter(|id| *id != client).collect())
            .unwrap_or_default();
        for id in recipients {
            if let Some(sender) = state.clients.get(&id) {
                let _ = sender.send(message.clone());
            }
        }
        Ok(())
    }

    fn disconnect(&self, client: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.clients.remove(&client);
            for subscribers in state.subscriptions.values_mut() {
                subscribers.remove(&client);
            }
        }
    }
}

/// A connection to a [`MemoryRelay`].
pub struct MemoryRelayClient {
    id: u64,
    relay: Arc<MemoryRelay>,
    inbound: broadcast::Sender<RelayMessage>,
    calls: Mutex<Vec<RelayCall>>,
    fail_publish: AtomicBool,
}

impl MemoryRelayClient {
    /// Calls made on this client, in order.
    pub fn calls(&self) -> Vec<RelayCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Topics published to, in order.
    pub fn published_topics(&self) -> Vec<Topic> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RelayCall::Publish { topic, .. } => Some(topic),
                _ => None,
            })
            .collect()
    }

    /// Make subsequent publishes fail with a transport error.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: RelayCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl Drop for MemoryRelayClient {
    fn drop(&mut self) {
        self.relay.disconnect(self.id);
    }
}

#[async_trait]
impl RelayTransport for MemoryRelayClient {
    async fn subscribe(&self, topic: &Topic) -> Result<()> {
        self.record(RelayCall::Subscribe(topic.clone()));
        self.relay.subscribe(self.id, topic)
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        self.record(RelayCall::Unsubscribe(topic.clone()));
        self.relay.unsubscribe(self.id, topic)
    }

    async fn publish(&self, topic: &Topic, message: &str, options: PublishOptions) -> Result<()> {
        self.record(RelayCall::Publish {
            topic: topic.clone(),
            tag: options.tag,
        });
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(AuthKitError::Transport("publish rejected by relay".into()));
        }
        let message = RelayMessage {
            topic: topic.clone(),
            message: message.to_string(),
            tag: options.tag,
            published_at: unix_now(),
        };
        self.relay.publish(self.id, message, options.ttl_secs)
    }

    fn inbound(&self) -> broadcast::Receiver<RelayMessage> {
        self.inbound.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_topic;

    #[tokio::test]
    async fn test_fan_out_skips_publisher() {
        let relay = MemoryRelay::new();
        let a = relay.connect();
        let b = relay.connect();
        let mut a_rx = a.inbound();
        let mut b_rx = b.inbound();
        let topic = derive_topic(b"t");

        a.subscribe(&topic).await.unwrap();
        b.subscribe(&topic).await.unwrap();
        a.publish(&topic, "hello", PublishOptions::new(1, 60)).await.unwrap();

        let got = b_rx.recv().await.unwrap();
        assert_eq!(got.message, "hello");
        assert_eq!(got.tag, 1);
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_subscriber_receives_stored_message() {
        let relay = MemoryRelay::new();
        let a = relay.connect();
        let b = relay.connect();
        let mut b_rx = b.inbound();
        let topic = derive_topic(b"t");

        a.publish(&topic, "early", PublishOptions::new(1, 60)).await.unwrap();
        assert_eq!(relay.stored_messages(&topic), 1);

        b.subscribe(&topic).await.unwrap();
        assert_eq!(b_rx.recv().await.unwrap().message, "early");
    }

    #[tokio::test]
    async fn test_call_log_and_publish_failure() {
        let relay = MemoryRelay::new();
        let a = relay.connect();
        let topic = derive_topic(b"t");

        a.subscribe(&topic).await.unwrap();
        a.set_fail_publish(true);
        let err = a.publish(&topic, "x", PublishOptions::new(7, 60)).await.unwrap_err();
        assert!(err.is_retryable());
        a.unsubscribe(&topic).await.unwrap();

        assert_eq!(
            a.calls(),
            vec![
                RelayCall::Subscribe(topic.clone()),
                RelayCall::Publish { topic: topic.clone(), tag: 7 },
                RelayCall::Unsubscribe(topic),
            ]
        );
    }
}
