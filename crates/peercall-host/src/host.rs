//! Host trait and stream types

use crate::peer::{PeerId, ProtocolId};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Ordered, bidirectional byte stream to one peer.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type Stream = Box<dyn AsyncStream>;

/// A stream accepted under a protocol the host listens on
pub struct IncomingStream {
    /// Peer that opened the stream
    pub remote: PeerId,
    pub protocol: ProtocolId,
    pub stream: Stream,
}

impl std::fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStream")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Callback invoked for every accepted stream.
///
/// Handlers run inside the host's async context and must not block; long
/// running work belongs on a spawned task.
pub type StreamHandler = Arc<dyn Fn(IncomingStream) + Send + Sync>;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("peer {peer} does not support protocol {protocol}")]
    ProtocolNotSupported { peer: PeerId, protocol: ProtocolId },

    #[error("host is closed")]
    Closed,
}

/// Network host: owns an identity, dials peers, accepts streams.
#[async_trait]
pub trait Host: Send + Sync {
    /// This host's peer identity
    fn id(&self) -> PeerId;

    /// Open a new stream to `peer` under `protocol`
    async fn open_stream(&self, peer: &PeerId, protocol: &ProtocolId)
        -> Result<Stream, HostError>;

    /// Install (or replace) the handler for streams opened under `protocol`
    fn set_stream_handler(&self, protocol: ProtocolId, handler: StreamHandler);

    /// Stop accepting streams under `protocol`
    fn remove_stream_handler(&self, protocol: &ProtocolId);
}
