//! Broadcast event streams.
//!
//! Each stream is a bounded `tokio::sync::broadcast` channel. Every receiver
//! sees every event; a receiver that falls more than the configured capacity
//! behind skips the oldest events and gets `RecvError::Lagged`. Publishing
//! never blocks and succeeds with no receivers.

use authkit_lib::{RpcId, Topic};
use tokio::sync::broadcast;

use crate::cacao::{AuthPayload, Cacao, Requester};
use crate::messages::ProtocolError;

/// An auth request received by a wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthRequest {
    pub id: RpcId,
    /// Pairing topic the request arrived on.
    pub topic: Topic,
    pub requester: Requester,
    pub payload: AuthPayload,
}

/// A completed auth request, as seen by the app.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthResponse {
    pub id: RpcId,
    /// Verified CACAO, or the error the wallet (or verification) produced.
    pub result: std::result::Result<Cacao, ProtocolError>,
}

/// Inbound request and completed response streams.
#[derive(Clone)]
pub struct EventStreams {
    requests: broadcast::Sender<AuthRequest>,
    responses: broadcast::Sender<AuthResponse>,
}

impl EventStreams {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (requests, _) = broadcast::channel(capacity);
        let (responses, _) = broadcast::channel(capacity);
        Self {
            requests,
            responses,
        }
    }

    pub fn subscribe_requests(&self) -> broadcast::Receiver<AuthRequest> {
        self.requests.subscribe()
    }

    pub fn subscribe_responses(&self) -> broadcast::Receiver<AuthResponse> {
        self.responses.subscribe()
    }

    pub(crate) fn publish_request(&self, request: AuthRequest) {
        tracing::debug!(id = %request.id, topic = %request.topic, "auth request event");
        // No receivers is not an error
        let _ = self.requests.send(request);
    }

    pub(crate) fn publish_response(&self, response: AuthResponse) {
        tracing::debug!(id = %response.id, ok = response.result.is_ok(), "auth response event");
        let _ = self.responses.send(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::AuthErrorCode;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_fan_out_to_every_receiver() {
        let streams = EventStreams::new(4);
        let mut a = streams.subscribe_responses();
        let mut b = streams.subscribe_responses();

        streams.publish_response(AuthResponse {
            id: RpcId(1),
            result: Err(AuthErrorCode::UserRejected.to_error()),
        });

        assert_eq!(a.recv().await.unwrap().id, RpcId(1));
        assert_eq!(b.recv().await.unwrap().id, RpcId(1));
    }

    #[tokio::test]
    async fn test_slow_receiver_lags() {
        let streams = EventStreams::new(2);
        let mut slow = streams.subscribe_responses();
        for id in 0..5 {
            streams.publish_response(AuthResponse {
                id: RpcId(id),
                result: Err(AuthErrorCode::RequestExpired.to_error()),
            });
        }
        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(slow.recv().await.unwrap().id, RpcId(3));
    }
}
