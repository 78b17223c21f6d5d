use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Per-connection call identifier, allocated by the client in increasing order.
pub type SequenceNumber = u64;

/// Client -> server: invoke `service.method` with `args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub service: String,
    pub method: String,
    pub seq: SequenceNumber,
    #[serde(default)]
    pub args: Value,
}

/// Server -> client: the outcome of one request.
///
/// `reply` is present whenever the method ran, including when it failed; a
/// partially populated reply must reach the caller. It is absent only when
/// dispatch failed before the method was invoked. A reply that encodes to
/// `null` is still present: `"reply":null` decodes to `Some(Value::Null)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub seq: SequenceNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub reply: Option<Value>,
}

/// Any value that appears on the wire, `null` included, is `Some`
fn present<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(d).map(Some)
}

impl ResponseEnvelope {
    pub fn success(seq: SequenceNumber, reply: Value) -> Self {
        Self {
            seq,
            error: None,
            reply: Some(reply),
        }
    }

    pub fn failure(seq: SequenceNumber, error: RemoteError, reply: Option<Value>) -> Self {
        Self {
            seq,
            error: Some(error),
            reply,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Error message, empty on success
    pub fn error_message(&self) -> String {
        self.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
    }
}

/// Error produced on the serving side of a call and carried back verbatim.
///
/// The same value is returned by the local fast path, so callers observe
/// identical errors whichever route a call took.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteError {
    /// Error returned by the invoked method itself
    #[error("{message}")]
    Application { message: String },

    #[error("rpc: can't find service {service}")]
    ServiceNotFound { service: String },

    #[error("rpc: can't find method {service}.{method}")]
    MethodNotFound { service: String, method: String },

    #[error("rpc: invalid argument for {service}.{method}: {reason}")]
    InvalidArgument {
        service: String,
        method: String,
        reason: String,
    },

    #[error("rpc: invalid reply for {service}.{method}: {reason}")]
    InvalidReply {
        service: String,
        method: String,
        reason: String,
    },
}

impl RemoteError {
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    pub fn invalid_argument(service: &str, method: &str, reason: impl ToString) -> Self {
        Self::InvalidArgument {
            service: service.to_string(),
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_reply(service: &str, method: &str, reason: impl ToString) -> Self {
        Self::InvalidReply {
            service: service.to_string(),
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for errors raised by the method, false for dispatch failures
    pub fn is_application(&self) -> bool {
        matches!(self, Self::Application { .. })
    }
}
