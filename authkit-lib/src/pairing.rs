//! Pairing registry.
//!
//! Tracks known pairings and guards their reuse: a request may only target
//! a topic that was registered first. Registration never overwrites; the
//! first pairing registered for a topic wins.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AppMetadata;
use crate::uri::PairingUri;
use crate::{AuthKitError, Result, Topic};

/// A shared channel established out of band.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pairing {
    pub topic: Topic,
    pub relay_protocol: String,
    /// Unix seconds.
    pub expiry: i64,
    pub active: bool,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_metadata: Option<AppMetadata>,
}

impl Pairing {
    pub fn new(topic: Topic, relay_protocol: impl Into<String>, expiry: i64) -> Self {
        Self {
            topic,
            relay_protocol: relay_protocol.into(),
            expiry,
            active: true,
            methods: Vec::new(),
            peer_metadata: None,
        }
    }

    /// Pairing described by a parsed URI.
    pub fn from_uri(uri: &PairingUri) -> Self {
        Self {
            methods: uri.methods.clone(),
            ..Self::new(uri.topic.clone(), uri.relay_protocol.clone(), uri.expiry_timestamp)
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry <= now
    }
}

/// Persistence for pairings.
#[async_trait]
pub trait PairingStore: Send + Sync {
    /// Insert unless a pairing already exists for the topic. Returns `true` if inserted.
    async fn insert(&self, pairing: Pairing) -> Result<bool>;

    async fn get(&self, topic: &Topic) -> Result<Option<Pairing>>;

    /// Replace an existing pairing.
    async fn update(&self, pairing: Pairing) -> Result<()>;

    async fn list(&self) -> Result<Vec<Pairing>>;

    async fn remove(&self, topic: &Topic) -> Result<()>;
}

/// In-memory pairing store.
#[derive(Default)]
pub struct MemoryPairingStore {
    pairings: RwLock<HashMap<Topic, Pairing>>,
}

impl MemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_error() -> AuthKitError {
    AuthKitError::Storage("pairing store lock poisoned".into())
}

#[async_trait]
impl PairingStore for MemoryPairingStore {
    async fn insert(&self, pairing: Pairing) -> Result<bool> {
        let mut pairings = self.pairings.write().map_err(|_| lock_error())?;
        if pairings.contains_key(&pairing.topic) {
            return Ok(false);
        }
        pairings.insert(pairing.topic.clone(), pairing);
        Ok(true)
    }

    async fn get(&self, topic: &Topic) -> Result<Option<Pairing>> {
        Ok(self.pairings.read().map_err(|_| lock_error())?.get(topic).cloned())
    }

    async fn update(&self, pairing: Pairing) -> Result<()> {
        let mut pairings = self.pairings.write().map_err(|_| lock_error())?;
        match pairings.get_mut(&pairing.topic) {
            Some(existing) => {
                *existing = pairing;
                Ok(())
            }
            None => Err(AuthKitError::not_found("pairing", pairing.topic.as_str())),
        }
    }

    async fn list(&self) -> Result<Vec<Pairing>> {
        let mut pairings: Vec<_> = self
            .pairings
            .read()
            .map_err(|_| lock_error())?
            .values()
            .cloned()
            .collect();
        pairings.sort_by(|a, b| a.topic.cmp(&b.topic));
        Ok(pairings)
    }

    async fn remove(&self, topic: &Topic) -> Result<()> {
        self.pairings.write().map_err(|_| lock_error())?.remove(topic);
        Ok(())
    }
}

/// Registry of known pairings over a [`PairingStore`].
#[derive(Clone)]
pub struct PairingRegistry {
    store: Arc<dyn PairingStore>,
}

impl PairingRegistry {
    pub fn new(store: Arc<dyn PairingStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPairingStore::new()))
    }

    /// Existence check. Inactive and expired pairings still count.
    pub async fn has_pairing(&self, topic: &Topic) -> Result<bool> {
        Ok(self.store.get(topic).await?.is_some())
    }

    /// Register a pairing. A topic that is already known is left untouched.
    pub async fn register(&self, pairing: Pairing) -> Result<bool> {
        let topic = pairing.topic.clone();
        let inserted = self.store.insert(pairing).await?;
        if inserted {
            tracing::info!(topic = %topic, "pairing registered");
        } else {
            tracing::debug!(topic = %topic, "pairing already registered");
        }
        Ok(inserted)
    }

    pub async fn get(&self, topic: &Topic) -> Result<Option<Pairing>> {
        self.store.get(topic).await
    }

    pub async fn list(&self) -> Result<Vec<Pairing>> {
        self.store.list().await
    }

    /// Mark a pairing inactive.
    pub async fn deactivate(&self, topic: &Topic) -> Result<()> {
        let mut pairing = self
            .store
            .get(topic)
            .await?
            .ok_or_else(|| AuthKitError::not_found("pairing", topic.as_str()))?;
        if pairing.active {
            pairing.active = false;
            self.store.update(pairing).await?;
            tracing::debug!(topic = %topic, "pairing deactivated");
        }
        Ok(())
    }

    /// Record the peer's metadata and extend the pairing's lifetime.
    pub async fn update_peer(
        &self,
        topic: &Topic,
        peer_metadata: Option<AppMetadata>,
        expiry: i64,
    ) -> Result<()> {
        let mut pairing = self
            .store
            .get(topic)
            .await?
            .ok_or_else(|| AuthKitError::not_found("pairing", topic.as_str()))?;
        if peer_metadata.is_some() {
            pairing.peer_metadata = peer_metadata;
        }
        pairing.expiry = pairing.expiry.max(expiry);
        self.store.update(pairing).await
    }

    /// Deactivate every active pairing whose expiry has passed.
    ///
    /// Returns the topics that were deactivated.
    pub async fn sweep_expired(&self, now: i64) -> Result<Vec<Topic>> {
        let mut expired = Vec::new();
        for mut pairing in self.store.list().await? {
            if pairing.active && pairing.is_expired(now) {
                pairing.active = false;
                expired.push(pairing.topic.clone());
                tracing::warn!(topic = %pairing.topic, expiry = pairing.expiry, "pairing expired");
                self.store.update(pairing).await?;
            }
        }
        Ok(expired)
    }
}
