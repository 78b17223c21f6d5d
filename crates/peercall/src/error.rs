//! Error types for registration and calls

use peercall_host::{HostError, PeerId};
use peercall_protocol::{CodecError, RemoteError, SequenceNumber};
use std::time::Duration;
use thiserror::Error;

/// Result type for calls
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors surfaced synchronously by `register`
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Receiver was handed over as a plain value instead of a shared handle
    #[error("rpc: register: receiver of type {type_name} must be shared (Arc<{type_name}>), not a plain value")]
    InvalidReceiver { type_name: String },

    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),

    #[error("rpc: register: no service name for type {0}")]
    InvalidServiceName(String),

    #[error("rpc: register: type {0} has no exported methods of suitable type")]
    NoMethods(String),
}

/// Framing or correlation failures on one stream
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("codec error on stream with {peer}: {source}")]
    Codec {
        peer: PeerId,
        #[source]
        source: CodecError,
    },

    #[error("unexpected sequence number {seq} from {peer}")]
    UnexpectedSequence { peer: PeerId, seq: SequenceNumber },
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Local destination but no server attached to the client
    #[error("cannot make local calls: no server attached to client")]
    NoLocalServer,

    #[error("failed to open stream to {peer}: {source}")]
    Open {
        peer: PeerId,
        #[source]
        source: HostError,
    },

    /// The stream broke (or was closed) while the call was outstanding
    #[error("connection to {peer} lost: {reason}")]
    Lost { peer: PeerId, reason: String },
}

/// Error returned by `Client::call`.
///
/// A failed call may still have written a meaningful reply: method errors
/// and the errors of a method that ran do not discard reply mutations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Dispatch failure or the invoked method's own error, identical on
    /// the local and remote paths
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("call {service}.{method} timed out after {elapsed:?}")]
    Timeout {
        service: String,
        method: String,
        elapsed: Duration,
    },
}

impl RpcError {
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }

    /// Error raised by the invoked method
    pub fn is_application(&self) -> bool {
        self.remote().is_some_and(RemoteError::is_application)
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Connection(ConnectionError::Lost { .. }))
    }
}
