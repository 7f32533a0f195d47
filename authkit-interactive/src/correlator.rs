//! Response correlation.
//!
//! Replies are matched to pending requests by id. The pending entry is
//! taken from the store atomically, so under relay redelivery exactly one
//! copy of a response is decoded and delivered; every other copy finds no
//! entry and is discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use authkit_lib::pending::{Direction, PendingRequest, PendingRequestStore};
use authkit_lib::{unix_now, RpcId, Topic};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::messages::{ProtocolError, ProtocolMethod, RpcOutcome};
use crate::{InteractiveError, Result};

/// Method-specific decoding (and verification) of a response.
#[async_trait]
pub trait ResponseDecoder: Send + Sync {
    /// Turn the raw outcome into the value delivered to the caller.
    async fn decode(
        &self,
        request: &PendingRequest,
        outcome: RpcOutcome,
    ) -> std::result::Result<Value, ProtocolError>;
}

/// A response matched to its request.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrelatedResponse {
    pub id: RpcId,
    /// The pending entry the response completed.
    pub request: PendingRequest,
    /// Topic the response arrived on.
    pub topic: Topic,
    pub result: std::result::Result<Value, ProtocolError>,
}

impl CorrelatedResponse {
    pub fn method(&self) -> Option<ProtocolMethod> {
        ProtocolMethod::from_method(&self.request.method)
    }

    pub fn into_result(self) -> Result<Value> {
        self.result.map_err(InteractiveError::from)
    }
}

/// Matches inbound responses against pending requests.
pub struct ResponseCorrelator {
    pending: Arc<dyn PendingRequestStore>,
    waiters: Mutex<HashMap<RpcId, oneshot::Sender<CorrelatedResponse>>>,
    decoders: RwLock<HashMap<&'static str, Arc<dyn ResponseDecoder>>>,
}

fn lock_error() -> InteractiveError {
    InteractiveError::Internal("correlator lock poisoned".into())
}

impl ResponseCorrelator {
    pub fn new(pending: Arc<dyn PendingRequestStore>) -> Arc<Self> {
        Arc::new(Self {
            pending,
            waiters: Mutex::new(HashMap::new()),
            decoders: RwLock::new(HashMap::new()),
        })
    }

    pub fn pending_store(&self) -> &Arc<dyn PendingRequestStore> {
        &self.pending
    }

    /// Install the decoder for responses to `method`.
    pub fn register_decoder(&self, method: ProtocolMethod, decoder: Arc<dyn ResponseDecoder>) -> Result<()> {
        self.decoders
            .write()
            .map_err(|_| lock_error())?
            .insert(method.method(), decoder);
        Ok(())
    }

    /// Register a waiter for `id`. Must happen before the request is published.
    pub fn register(self: &Arc<Self>, id: RpcId) -> Result<PendingCall> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().map_err(|_| lock_error())?.insert(id, tx);
        Ok(PendingCall {
            id,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Number of registered waiters.
    pub fn waiting(&self) -> usize {
        self.waiters.lock().map(|w| w.len()).unwrap_or(0)
    }

    fn take_waiter(&self, id: RpcId) -> Result<Option<oneshot::Sender<CorrelatedResponse>>> {
        Ok(self.waiters.lock().map_err(|_| lock_error())?.remove(&id))
    }

    /// Match a response to its pending request and complete the waiter.
    ///
    /// Returns `None` when the response was discarded (unknown id, already
    /// completed, not one of our requests, or expired).
    pub async fn correlate(
        &self,
        topic: &Topic,
        id: RpcId,
        outcome: RpcOutcome,
    ) -> Result<Option<CorrelatedResponse>> {
        match self.pending.get(id).await? {
            Some(entry) if entry.direction == Direction::Outgoing => {}
            Some(_) => {
                tracing::warn!(id = %id, topic = %topic, "discarding response to an incoming request id");
                return Ok(None);
            }
            None => {
                tracing::warn!(id = %id, topic = %topic, "discarding response for unknown request");
                return Ok(None);
            }
        }

        let Some(request) = self.pending.remove(id).await? else {
            tracing::debug!(id = %id, "response already correlated");
            return Ok(None);
        };
        let waiter = self.take_waiter(id)?;

        if request.is_expired(unix_now()) {
            tracing::warn!(id = %id, expiry = request.expiry, "discarding late response");
            return Ok(None);
        }

        let decoder = self
            .decoders
            .read()
            .map_err(|_| lock_error())?
            .get(request.method.as_str())
            .cloned();
        let result = match decoder {
            Some(decoder) => decoder.decode(&request, outcome).await,
            None => match outcome {
                RpcOutcome::Success(value) => Ok(value),
                RpcOutcome::Failure(error) => Err(error),
            },
        };

        tracing::info!(id = %id, method = %request.method, ok = result.is_ok(), "response correlated");
        let response = CorrelatedResponse {
            id,
            request,
            topic: topic.clone(),
            result,
        };
        if let Some(waiter) = waiter {
            // The caller may have stopped waiting
            let _ = waiter.send(response.clone());
        }
        Ok(Some(response))
    }

    /// Drop the waiter and the pending entry for `id`.
    ///
    /// Shared by cancellation and timeout; late responses are then discarded.
    pub async fn release(&self, id: RpcId) -> Result<()> {
        self.take_waiter(id)?;
        if self.pending.remove(id).await?.is_some() {
            tracing::debug!(id = %id, "pending request released");
        }
        Ok(())
    }

    /// Release every outgoing request whose expiry has passed.
    pub async fn sweep_expired(&self, now: i64) -> Result<Vec<RpcId>> {
        let mut released = Vec::new();
        for entry in self.pending.list_all().await? {
            if entry.direction == Direction::Outgoing && entry.is_expired(now) {
                self.release(entry.id).await?;
                released.push(entry.id);
            }
        }
        Ok(released)
    }
}

/// Handle on a dispatched request.
///
/// Dropping the handle stops waiting but keeps the pending entry; the
/// response is still correlated and published on the event streams.
#[derive(Debug)]
pub struct PendingCall {
    id: RpcId,
    rx: oneshot::Receiver<CorrelatedResponse>,
    correlator: Arc<ResponseCorrelator>,
}

impl std::fmt::Debug for ResponseCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCorrelator")
            .field("waiting", &self.waiting())
            .finish_non_exhaustive()
    }
}

impl PendingCall {
    pub fn id(&self) -> RpcId {
        self.id
    }

    /// Wait for the correlated response.
    pub async fn wait(self) -> Result<CorrelatedResponse> {
        self.rx.await.map_err(|_| InteractiveError::Cancelled)
    }

    /// Wait at most `timeout`; on expiry the request is released as if cancelled.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<CorrelatedResponse> {
        let Self { id, rx, correlator } = self;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(InteractiveError::Cancelled),
            Err(_) => {
                correlator.release(id).await?;
                tracing::debug!(id = %id, "pending request timed out");
                Err(InteractiveError::Timeout)
            }
        }
    }

    /// Abandon the request.
    pub async fn cancel(self) -> Result<()> {
        self.correlator.release(self.id).await
    }
}
