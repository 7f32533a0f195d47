use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{Result, Topic};

/// A message delivered by the relay on a subscribed topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub topic: Topic,
    /// Base64 envelope, opaque to the relay.
    pub message: String,
    /// Tag set by the publisher (identifies the protocol method).
    pub tag: u32,
    pub published_at: i64,
}

/// Publish parameters attached to a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    pub tag: u32,
    /// How long the relay keeps the message for late subscribers.
    pub ttl_secs: i64,
    /// Whether the relay should wake the peer (push notification).
    pub prompt: bool,
}

impl PublishOptions {
    pub fn new(tag: u32, ttl_secs: i64) -> Self {
        Self {
            tag,
            ttl_secs,
            prompt: false,
        }
    }

    pub fn with_prompt(mut self) -> Self {
        self.prompt = true;
        self
    }
}

/// Publish/subscribe relay.
///
/// Delivery is at-least-once per topic with no ordering across topics.
/// Retry policy, if any, belongs to the implementation.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn subscribe(&self, topic: &Topic) -> Result<()>;

    async fn unsubscribe(&self, topic: &Topic) -> Result<()>;

    async fn publish(&self, topic: &Topic, message: &str, options: PublishOptions) -> Result<()>;

    /// Stream of inbound messages for every subscribed topic.
    fn inbound(&self) -> broadcast::Receiver<RelayMessage>;
}
