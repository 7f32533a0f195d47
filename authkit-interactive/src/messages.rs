//! JSON-RPC message model and the protocol method table.
//!
//! The envelope type (`type0`/`type1`) is transport metadata and never
//! appears in these bodies.

use authkit_lib::RpcId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol methods and their relay parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolMethod {
    /// App asks a wallet to sign in over a pairing.
    AuthRequest,
    /// Account asks a service for its subscriptions and to be kept informed.
    WatchSubscriptions,
}

impl ProtocolMethod {
    pub const ALL: [ProtocolMethod; 2] = [Self::AuthRequest, Self::WatchSubscriptions];

    pub fn method(&self) -> &'static str {
        match self {
            Self::AuthRequest => "wc_authRequest",
            Self::WatchSubscriptions => "wc_notifyWatchSubscriptions",
        }
    }

    pub fn from_method(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.method() == method)
    }

    /// Relay tag of requests.
    pub fn request_tag(&self) -> u32 {
        match self {
            Self::AuthRequest => 3000,
            Self::WatchSubscriptions => 4010,
        }
    }

    /// Relay tag of responses.
    pub fn response_tag(&self) -> u32 {
        match self {
            Self::AuthRequest => 3001,
            Self::WatchSubscriptions => 4011,
        }
    }

    /// Relay TTL of messages of this method.
    pub fn ttl_secs(&self) -> i64 {
        match self {
            Self::AuthRequest => 24 * 60 * 60,
            Self::WatchSubscriptions => 5 * 60,
        }
    }

    /// Whether the peer should be woken for requests of this method.
    pub fn prompt(&self) -> bool {
        matches!(self, Self::AuthRequest)
    }
}

impl std::fmt::Display for ProtocolMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.method())
    }
}

/// Error codes carried in JSON-RPC `error.code`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum AuthErrorCode {
    UserRejected = 14001,
    MalformedResponseParams = 12001,
    MalformedRequestParams = 12002,
    MessageCompromised = 12003,
    SignatureVerificationFailed = 12004,
    RequestExpired = 12005,
}

impl AuthErrorCode {
    pub fn code(&self) -> i64 {
        *self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            14001 => Some(Self::UserRejected),
            12001 => Some(Self::MalformedResponseParams),
            12002 => Some(Self::MalformedRequestParams),
            12003 => Some(Self::MessageCompromised),
            12004 => Some(Self::SignatureVerificationFailed),
            12005 => Some(Self::RequestExpired),
            _ => None,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::UserRejected => "Auth request rejected by user",
            Self::MalformedResponseParams => "Response params malformed",
            Self::MalformedRequestParams => "Request params malformed",
            Self::MessageCompromised => "Original message compromised",
            Self::SignatureVerificationFailed => "Message verification failed",
            Self::RequestExpired => "Request expired",
        }
    }

    pub fn to_error(&self) -> ProtocolError {
        ProtocolError {
            code: self.code(),
            message: self.message().to_string(),
        }
    }
}

/// A structured error returned by the counterparty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: i64,
    pub message: String,
}

impl ProtocolError {
    /// Known code, if any.
    pub fn kind(&self) -> Option<AuthErrorCode> {
        AuthErrorCode::from_code(self.code)
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: RpcId,
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: RpcId, method: ProtocolMethod, params: Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.method().to_string(),
            params,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    pub id: RpcId,
    pub jsonrpc: String,
    pub result: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorResponse {
    pub id: RpcId,
    pub jsonrpc: String,
    pub error: ProtocolError,
}

/// Any JSON-RPC body seen on the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcPayload {
    Request(RpcRequest),
    Result(RpcResult),
    Error(RpcErrorResponse),
}

impl RpcPayload {
    pub fn id(&self) -> RpcId {
        match self {
            Self::Request(r) => r.id,
            Self::Result(r) => r.id,
            Self::Error(r) => r.id,
        }
    }

    pub fn result(id: RpcId, result: Value) -> Self {
        Self::Result(RpcResult {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
        })
    }

    pub fn error(id: RpcId, error: ProtocolError) -> Self {
        Self::Error(RpcErrorResponse {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            error,
        })
    }
}

/// Outcome carried by a response: the result value or the peer's error.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcOutcome {
    Success(Value),
    Failure(ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_untagged_payload_decoding() {
        let request: RpcPayload = serde_json::from_value(json!({
            "id": 1, "jsonrpc": "2.0", "method": "wc_authRequest", "params": {}
        }))
        .unwrap();
        assert!(matches!(request, RpcPayload::Request(_)));

        let result: RpcPayload =
            serde_json::from_value(json!({ "id": 2, "jsonrpc": "2.0", "result": true })).unwrap();
        assert!(matches!(result, RpcPayload::Result(_)));

        let error: RpcPayload = serde_json::from_value(json!({
            "id": 3, "jsonrpc": "2.0", "error": { "code": 14001, "message": "no" }
        }))
        .unwrap();
        match error {
            RpcPayload::Error(e) => assert_eq!(e.error.kind(), Some(AuthErrorCode::UserRejected)),
            other => panic!("expected error, got {:?}", other),
        }

        assert!(serde_json::from_value::<RpcPayload>(json!({ "id": 4 })).is_err());
    }

    #[test]
    fn test_method_table() {
        for method in ProtocolMethod::ALL {
            assert_eq!(ProtocolMethod::from_method(method.method()), Some(method));
            assert_eq!(method.response_tag(), method.request_tag() + 1);
        }
        assert_eq!(ProtocolMethod::from_method("wc_unknown"), None);
    }

    #[test]
    fn test_unknown_error_code() {
        let error = ProtocolError {
            code: 5000,
            message: "other".into(),
        };
        assert_eq!(error.kind(), None);
        assert_eq!(AuthErrorCode::UserRejected.to_error().code, 14001);
    }
}
